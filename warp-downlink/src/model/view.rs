//! Views a model fans changes out to.

use crate::error::DownlinkError;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Identity of one downlink handle, stable across the models it attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownlinkId(Uuid);

impl DownlinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DownlinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DownlinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks a model delivers to one attached view.
///
/// For every envelope, `will_*` reaches all views before any `did_*` fires.
/// No model lock is held while these run.
pub trait ModelView<C>: Send + Sync {
    fn id(&self) -> DownlinkId;

    fn will_link(&self) {}

    fn did_link(&self) {}

    fn will_sync(&self) {}

    fn did_sync(&self) {}

    fn will_change(&self, _change: &C) {}

    fn did_change(&self, _change: &C) {}

    fn will_unlink(&self) {}

    fn did_unlink(&self) {}

    fn did_connect(&self) {}

    fn did_disconnect(&self) {}

    fn did_fail(&self, _error: &DownlinkError) {}

    /// The model dropped this view without the handle asking.
    fn did_detach(&self) {}
}

//! Capabilities a handle needs from whatever owns the model registry.

use crate::model::{LinkEnv, LinkModel};
use crate::uri::Uri;
use std::sync::Arc;

/// Registry capabilities a downlink handle needs to find or share a model.
pub trait DownlinkContext: Send + Sync {
    /// The model registered under `(host, node, lane)`, if any.
    fn get_downlink(&self, host: &Uri, node: &Uri, lane: &Uri) -> Option<Arc<dyn LinkModel>>;

    /// Environment for a model about to be created on `host`.
    fn link_env(&self, host: &Uri) -> LinkEnv;

    /// Registers and starts `model`. If another model already owns its key,
    /// that one is returned and `model` is discarded.
    fn open_downlink(&self, model: Arc<dyn LinkModel>) -> Arc<dyn LinkModel>;

    /// Unlinks `model` for every handle attached to it.
    fn unlink_downlink(&self, model: &Arc<dyn LinkModel>);

    /// Unlinks `model` and drops it from the registry.
    fn close_downlink(&self, model: &Arc<dyn LinkModel>);
}

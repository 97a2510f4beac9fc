//! Host, node and lane addressing.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

const SCHEME_SEPARATOR: &str = "://";

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the scheme of an absolute URI (`warp` in `warp://host:9001/a`).
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.0.split_once(SCHEME_SEPARATOR)?;
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        valid.then_some(scheme)
    }

    pub fn is_absolute(&self) -> bool {
        self.scheme().is_some()
    }

    /// Returns `scheme://authority` of an absolute URI.
    pub fn origin(&self) -> Option<Uri> {
        let scheme = self.scheme()?;
        let rest = &self.0[scheme.len() + SCHEME_SEPARATOR.len()..];
        let authority = rest.split('/').next().unwrap_or_default();
        Some(Uri(format!("{scheme}{SCHEME_SEPARATOR}{authority}")))
    }

    /// Returns the path part; relative URIs are all path.
    pub fn path(&self) -> &str {
        match self.origin() {
            Some(origin) => &self.0[origin.0.len()..],
            None => &self.0,
        }
    }

    /// Resolves `relative` against this URI.
    ///
    /// Absolute references are returned unchanged, rooted paths replace the
    /// path of `self`, and other paths replace its last segment.
    pub fn resolve(&self, relative: &Uri) -> Uri {
        if relative.is_absolute() || self.is_empty() {
            return relative.clone();
        }
        let origin = self.origin().map(|origin| origin.0).unwrap_or_default();
        if relative.0.starts_with('/') {
            return Uri(format!("{origin}{}", relative.0));
        }
        let base_path = self.path();
        let directory = match base_path.rfind('/') {
            Some(index) => &base_path[..=index],
            None => "/",
        };
        Uri(format!("{origin}{directory}{}", relative.0))
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(uri: &str) -> Self {
        Uri::new(uri)
    }
}

impl From<String> for Uri {
    fn from(uri: String) -> Self {
        Uri(uri)
    }
}

impl From<&Uri> for Uri {
    fn from(uri: &Uri) -> Self {
        uri.clone()
    }
}

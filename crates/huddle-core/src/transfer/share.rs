//! Access rules for shared directories.
//!
//! A share may carry a password and an expiry. Passwords are kept only as
//! BLAKE3 digests and compared digest to digest.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// A shared directory and who may read from it
#[derive(Debug, Clone)]
pub struct ShareAccess {
    root: PathBuf,
    password: Option<blake3::Hash>,
    expires_at: Option<Instant>,
}

impl ShareAccess {
    /// Open share rooted at `root` that never expires
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            password: None,
            expires_at: None,
        }
    }

    /// Require `password` on every request
    #[must_use]
    pub fn with_password(mut self, password: impl AsRef<str>) -> Self {
        self.password = Some(blake3::hash(password.as_ref().as_bytes()));
        self
    }

    /// Stop serving the share `ttl` from now
    #[must_use]
    pub fn expires_after(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Instant::now() + ttl);
        self
    }

    /// Directory the share maps to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether requests must carry a password
    pub fn is_protected(&self) -> bool {
        self.password.is_some()
    }

    /// Whether the share has outlived its expiry
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }

    /// Check a supplied password; open shares accept anything
    pub fn admits(&self, supplied: Option<&str>) -> bool {
        match (&self.password, supplied) {
            (None, _) => true,
            (Some(expected), Some(supplied)) => *expected == blake3::hash(supplied.as_bytes()),
            (Some(_), None) => false,
        }
    }
}

//! Web eID Common - Shared data structures for the Web eID host
//!
//! Result codes, certificate descriptors, hash algorithms and context
//! identifiers used by the card, PKI and host crates.

pub mod certificate;
pub mod error;
pub mod hash;

pub use certificate::{Certificate, CertificatePurpose};
pub use error::{Failure, ResultCode};
pub use hash::HashAlgorithm;

use std::fmt;

use uuid::Uuid;

/// Version reported to browsers, overridable at build time
pub const VERSION: &str = match option_env!("WEBEID_VERSION") {
    Some(version) => version,
    None => "1.0.0.0",
};

/// Identity of one browser context (a tab or extension connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Generate a fresh, globally unique context id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

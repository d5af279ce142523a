//! Credential operations
//!
//! One [`Operation`] is created per request and dropped when its result is
//! produced, so no certificate, hash or nonce outlives the request that
//! supplied it.

use std::fmt;

use tracing::debug;
use webeid_common::{CertificatePurpose, ContextId, HashAlgorithm};

/// What the browser asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    SelectCertificate {
        purpose: CertificatePurpose,
    },
    Sign {
        /// DER of the certificate whose key signs
        certificate: Vec<u8>,
        hash: Vec<u8>,
        algorithm: HashAlgorithm,
    },
    Authenticate {
        nonce: String,
    },
}

impl OperationRequest {
    pub fn name(&self) -> &'static str {
        match self {
            OperationRequest::SelectCertificate { .. } => "CERT",
            OperationRequest::Sign { .. } => "SIGN",
            OperationRequest::Authenticate { .. } => "AUTH",
        }
    }
}

/// Progress of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    SelectingCertificate,
    Authenticating,
    AwaitingPin,
    Signing,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request in flight, identified by context and message id
#[derive(Debug)]
pub struct Operation {
    pub context: ContextId,
    pub id: String,
    pub origin: String,
    pub request: OperationRequest,
    state: OperationState,
}

impl Operation {
    pub fn new(context: ContextId, id: impl Into<String>, origin: impl Into<String>, request: OperationRequest) -> Self {
        Self {
            context,
            id: id.into(),
            origin: origin.into(),
            request,
            state: OperationState::Idle,
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub(crate) fn advance(&mut self, state: OperationState) {
        debug!(context = %self.context, id = %self.id, from = %self.state, to = %state, "Operation state");
        self.state = state;
    }
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    /// DER of the selected certificate
    Certificate(Vec<u8>),
    Signature(Vec<u8>),
    /// Compact JWS authentication token
    Token(String),
}

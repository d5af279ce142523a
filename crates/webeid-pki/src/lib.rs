//! Web eID PKI - certificate selection, signing and authentication
//!
//! This crate drives a PKCS#11 token on behalf of browser requests: it
//! enumerates certificates, asks the user for a PIN through the [`Dialogs`]
//! capability, signs document hashes and issues origin-bound authentication
//! tokens. All of it runs on the [`PkiWorker`] thread.

pub mod auth_token;
pub mod dialogs;
pub mod error;
pub mod operation;
pub mod orchestrator;
pub mod pkcs11;
pub mod token;
pub mod worker;
pub mod x509;

#[cfg(test)]
mod testing;

pub use dialogs::{Dialogs, HeadlessDialogs, Outcome, PinRequest};
pub use error::PkiError;
pub use operation::{Operation, OperationOutput, OperationRequest, OperationState};
pub use orchestrator::Orchestrator;
pub use pkcs11::Pkcs11Token;
pub use token::{PinStatus, Token, TokenInfo};
pub use worker::{PkiCommand, PkiHandle, PkiOutcome, PkiWorker};

//! Errors raised by the token and credential layer

use cryptoki::error::{Error as CryptokiError, RvError};
use thiserror::Error;
use webeid_common::Failure;

/// Token, dialog and authentication token errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PkiError {
    /// Wrong PIN; the token may allow another attempt
    #[error("PIN incorrect")]
    PinIncorrect,

    /// PIN retries are exhausted
    #[error("PIN locked")]
    PinLocked,

    /// The user or the token cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Card or reader went away during the operation
    #[error("token removed")]
    TokenRemoved,

    #[error("not logged in to token")]
    NotLoggedIn,

    /// No private key matches the certificate
    #[error("private key not found")]
    KeyNotFound,

    /// Certificate is not present on any token
    #[error("certificate not found on any token")]
    UnknownCertificate,

    /// Malformed certificate
    #[error("certificate: {0}")]
    Certificate(String),

    /// Any other PKCS#11 failure, with the return value name
    #[error("PKCS#11: {0}")]
    Token(String),

    /// A dialog could not be shown
    #[error("dialog: {0}")]
    Dialog(String),

    /// Authentication token failed verification
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

impl From<CryptokiError> for PkiError {
    fn from(error: CryptokiError) -> Self {
        match error {
            CryptokiError::Pkcs11(rv, ..) => classify(rv),
            other => PkiError::Token(other.to_string()),
        }
    }
}

/// Map a PKCS#11 return value to a PIN-retry-aware error
pub fn classify(rv: RvError) -> PkiError {
    match rv {
        RvError::PinIncorrect => PkiError::PinIncorrect,
        RvError::PinLocked => PkiError::PinLocked,
        RvError::FunctionCanceled => PkiError::Cancelled,
        RvError::TokenNotPresent | RvError::DeviceRemoved | RvError::SessionHandleInvalid => {
            PkiError::TokenRemoved
        }
        RvError::UserNotLoggedIn => PkiError::NotLoggedIn,
        other => PkiError::Token(format!("{:?}", other)),
    }
}

impl From<der::Error> for PkiError {
    fn from(error: der::Error) -> Self {
        PkiError::Certificate(error.to_string())
    }
}

impl From<PkiError> for Failure {
    fn from(error: PkiError) -> Self {
        match error {
            PkiError::PinLocked => Failure::PinBlocked,
            PkiError::Cancelled => Failure::UserCancelled,
            PkiError::UnknownCertificate | PkiError::Certificate(_) => {
                Failure::InvalidArgument(error.to_string())
            }
            other => Failure::technical(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_pkcs11_codes() {
        assert_eq!(classify(RvError::PinIncorrect), PkiError::PinIncorrect);
        assert_eq!(classify(RvError::PinLocked), PkiError::PinLocked);
        assert_eq!(classify(RvError::FunctionCanceled), PkiError::Cancelled);
        assert_eq!(classify(RvError::DeviceRemoved), PkiError::TokenRemoved);
        assert!(matches!(classify(RvError::GeneralError), PkiError::Token(_)));
    }

    #[test]
    fn test_failure_mapping() {
        assert_eq!(Failure::from(PkiError::PinLocked), Failure::PinBlocked);
        assert_eq!(Failure::from(PkiError::Cancelled), Failure::UserCancelled);
        assert!(matches!(
            Failure::from(PkiError::TokenRemoved),
            Failure::TechnicalError { .. }
        ));
    }
}

//! Failure taxonomy shared by every subsystem
//!
//! Each failure maps to exactly one `result` literal on the wire. Subsystem
//! errors (`CardError`, `PkiError`) convert into [`Failure`] before they reach
//! the protocol layer.

use thiserror::Error;

/// Value of the `result` field in a response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    InvalidArgument,
    NotAllowed,
    UserCancel,
    TechnicalError,
    NoCertificates,
    ReaderInUse,
    InvalidState,
    PinBlocked,
}

impl ResultCode {
    /// Wire literal of this result code
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::InvalidArgument => "invalid_argument",
            ResultCode::NotAllowed => "not_allowed",
            ResultCode::UserCancel => "user_cancel",
            ResultCode::TechnicalError => "technical_error",
            ResultCode::NoCertificates => "no_certificates",
            ResultCode::ReaderInUse => "reader_in_use",
            ResultCode::InvalidState => "invalid_state",
            ResultCode::PinBlocked => "pin_blocked",
        }
    }
}

/// Typed failure of a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// Malformed or missing fields, origin mismatch, bad protocol hint
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Insecure or otherwise disallowed origin
    #[error("origin not allowed: {0}")]
    NotAllowed(String),

    /// The user rejected a dialog
    #[error("cancelled by user")]
    UserCancelled,

    /// Hardware, driver or token failure, with the platform status code if any
    #[error("technical error: {message}")]
    TechnicalError { message: String, code: Option<u64> },

    /// No eligible certificate is available
    #[error("no certificates available")]
    NoCertificates,

    /// The reader is used by another connection
    #[error("reader {0} is in use")]
    ReaderBusy(String),

    /// Another operation is already in flight for the context
    #[error("another request is already in progress")]
    InvalidState,

    /// PIN retries are exhausted
    #[error("PIN is blocked")]
    PinBlocked,
}

impl Failure {
    /// Technical error without a platform status code
    pub fn technical(message: impl Into<String>) -> Self {
        Failure::TechnicalError {
            message: message.into(),
            code: None,
        }
    }

    /// Result code written to the wire for this failure
    pub fn result_code(&self) -> ResultCode {
        match self {
            Failure::InvalidArgument(_) => ResultCode::InvalidArgument,
            Failure::NotAllowed(_) => ResultCode::NotAllowed,
            Failure::UserCancelled => ResultCode::UserCancel,
            Failure::TechnicalError { .. } => ResultCode::TechnicalError,
            Failure::NoCertificates => ResultCode::NoCertificates,
            Failure::ReaderBusy(_) => ResultCode::ReaderInUse,
            Failure::InvalidState => ResultCode::InvalidState,
            Failure::PinBlocked => ResultCode::PinBlocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_literals() {
        assert_eq!(ResultCode::Ok.as_str(), "ok");
        assert_eq!(
            Failure::InvalidArgument("x".into()).result_code().as_str(),
            "invalid_argument"
        );
        assert_eq!(Failure::UserCancelled.result_code().as_str(), "user_cancel");
        assert_eq!(
            Failure::NotAllowed("http://example.com".into())
                .result_code()
                .as_str(),
            "not_allowed"
        );
        assert_eq!(
            Failure::ReaderBusy("Reader 0".into()).result_code().as_str(),
            "reader_in_use"
        );
    }

    #[test]
    fn test_technical_error_keeps_code() {
        let failure = Failure::TechnicalError {
            message: "transmit failed".into(),
            code: Some(0x8010_0016),
        };
        assert_eq!(failure.result_code(), ResultCode::TechnicalError);
        match failure {
            Failure::TechnicalError { code, .. } => assert_eq!(code, Some(0x8010_0016)),
            _ => unreachable!(),
        }
    }
}

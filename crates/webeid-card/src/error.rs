//! Errors raised by the PC/SC layer

use thiserror::Error;
use webeid_common::Failure;

/// Card and reader errors
#[derive(Debug, Error)]
pub enum CardError {
    /// A PC/SC call failed; the status is kept unchanged for diagnostics
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Protocol hint other than "T=0", "T=1" or "*"
    #[error("invalid protocol {0:?}")]
    InvalidProtocol(String),

    /// A session to this reader is already open
    #[error("reader {0} is in use")]
    InUse(String),

    /// Command requires a connected session
    #[error("reader {0} is not connected")]
    NotConnected(String),

    /// Command APDU is shorter than its four byte header
    #[error("APDU of {0} bytes is too short")]
    ShortApdu(usize),

    /// The session worker thread is gone
    #[error("session worker for {0} stopped")]
    WorkerGone(String),
}

/// Numeric PC/SC status of an error
pub fn status_code(error: pcsc::Error) -> u64 {
    error as u32 as u64
}

impl From<CardError> for Failure {
    fn from(error: CardError) -> Self {
        match error {
            CardError::Pcsc(pcsc::Error::SharingViolation) => {
                Failure::ReaderBusy("sharing violation".to_string())
            }
            CardError::Pcsc(e) => Failure::TechnicalError {
                message: format!("{:?}", e),
                code: Some(status_code(e)),
            },
            CardError::InvalidProtocol(_) | CardError::ShortApdu(_) => {
                Failure::InvalidArgument(error.to_string())
            }
            CardError::InUse(reader) => Failure::ReaderBusy(reader),
            CardError::NotConnected(_) => Failure::InvalidState,
            CardError::WorkerGone(_) => Failure::technical(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharing_violation_is_reader_busy() {
        let failure: Failure = CardError::Pcsc(pcsc::Error::SharingViolation).into();
        assert!(matches!(failure, Failure::ReaderBusy(_)));
    }

    #[test]
    fn test_pcsc_status_is_preserved() {
        let failure: Failure = CardError::Pcsc(pcsc::Error::RemovedCard).into();
        match failure {
            Failure::TechnicalError { code, .. } => {
                assert_eq!(code, Some(status_code(pcsc::Error::RemovedCard)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_protocol_is_invalid_argument() {
        let failure: Failure = CardError::InvalidProtocol("T=2".into()).into();
        assert!(matches!(failure, Failure::InvalidArgument(_)));
    }
}

//! User dialogs needed by the credential orchestrator
//!
//! The orchestrator only knows the [`Dialogs`] capability. The host chooses an
//! implementation: interactive on a terminal, or [`HeadlessDialogs`] for
//! unattended use.

use std::sync::atomic::AtomicBool;

use secrecy::SecretString;
use tracing::info;
use webeid_common::{Certificate, CertificatePurpose};

use crate::error::PkiError;
use crate::token::TokenInfo;

/// Result of a dialog the user may dismiss
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Accepted(T),
    Cancelled,
}

/// Everything a PIN prompt shows
#[derive(Debug)]
pub struct PinRequest<'a> {
    pub origin: &'a str,
    pub token: &'a TokenInfo,
    pub purpose: CertificatePurpose,
    /// Why the previous attempt failed, `None` on the first prompt
    pub last_error: Option<&'a PkiError>,
    /// Only one attempt is left before the PIN locks
    pub final_try: bool,
}

/// Interactive collaborators of the orchestrator
pub trait Dialogs: Send + Sync {
    fn prompt_pin(&self, request: &PinRequest<'_>) -> Result<Outcome<SecretString>, PkiError>;

    /// Pick one of `candidates`; returns its index
    fn select_certificate(
        &self,
        origin: &str,
        candidates: &[Certificate],
        purpose: CertificatePurpose,
    ) -> Result<Outcome<usize>, PkiError>;

    /// Tell the user that `origin` is using `reader`
    ///
    /// Blocks while `open` stays set. Returns true when the user asked to end
    /// the access.
    fn notify_reader_busy(&self, origin: &str, reader: &str, open: &AtomicBool) -> bool;
}

/// Dialogs for unattended use
///
/// The PIN comes from configuration and is offered once; a rejected PIN is
/// never retried so a wrong value cannot lock the card.
pub struct HeadlessDialogs {
    pin: Option<SecretString>,
}

impl HeadlessDialogs {
    pub fn new(pin: Option<SecretString>) -> Self {
        Self { pin }
    }

    /// PIN from the `WEBEID_PIN` environment variable
    pub fn from_env() -> Self {
        Self::new(std::env::var("WEBEID_PIN").ok().map(SecretString::new))
    }
}

impl Dialogs for HeadlessDialogs {
    fn prompt_pin(&self, request: &PinRequest<'_>) -> Result<Outcome<SecretString>, PkiError> {
        match (&self.pin, request.last_error) {
            (Some(pin), None) => Ok(Outcome::Accepted(pin.clone())),
            _ => {
                info!(origin = request.origin, token = %request.token.label, "No PIN available, cancelling");
                Ok(Outcome::Cancelled)
            }
        }
    }

    fn select_certificate(
        &self,
        _origin: &str,
        candidates: &[Certificate],
        _purpose: CertificatePurpose,
    ) -> Result<Outcome<usize>, PkiError> {
        if candidates.is_empty() {
            return Ok(Outcome::Cancelled);
        }
        Ok(Outcome::Accepted(0))
    }

    fn notify_reader_busy(&self, origin: &str, reader: &str, _open: &AtomicBool) -> bool {
        info!(origin, reader, "Reader in use");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::PinStatus;
    use secrecy::ExposeSecret;

    fn token() -> TokenInfo {
        TokenInfo {
            label: "PIN2".into(),
            serial: "1234".into(),
            pin_status: PinStatus::Ok,
        }
    }

    #[test]
    fn test_headless_pin_is_offered_once() {
        let dialogs = HeadlessDialogs::new(Some(SecretString::new("12345".into())));
        let token = token();
        let mut request = PinRequest {
            origin: "https://example.com",
            token: &token,
            purpose: CertificatePurpose::Signing,
            last_error: None,
            final_try: false,
        };
        match dialogs.prompt_pin(&request).unwrap() {
            Outcome::Accepted(pin) => assert_eq!(pin.expose_secret(), "12345"),
            Outcome::Cancelled => panic!("expected PIN"),
        }

        let failed = PkiError::PinIncorrect;
        request.last_error = Some(&failed);
        assert!(matches!(dialogs.prompt_pin(&request).unwrap(), Outcome::Cancelled));
    }

    #[test]
    fn test_headless_without_pin_cancels() {
        let dialogs = HeadlessDialogs::new(None);
        let token = token();
        let request = PinRequest {
            origin: "https://example.com",
            token: &token,
            purpose: CertificatePurpose::Authentication,
            last_error: None,
            final_try: false,
        };
        assert!(matches!(dialogs.prompt_pin(&request).unwrap(), Outcome::Cancelled));
        assert!(!dialogs.notify_reader_busy("https://example.com", "Reader 0", &AtomicBool::new(true)));
    }
}

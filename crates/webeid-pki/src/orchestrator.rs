//! Credential orchestrator
//!
//! Turns one [`Operation`] into token calls: certificate selection, PIN entry
//! with retry accounting, and signing. Certificates are cached per reader and
//! refreshed from reader events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use webeid_common::{Certificate, CertificatePurpose, Failure, HashAlgorithm};

use crate::auth_token;
use crate::dialogs::{Dialogs, Outcome, PinRequest};
use crate::error::PkiError;
use crate::operation::{Operation, OperationOutput, OperationRequest, OperationState};
use crate::token::{PinStatus, Token};
use crate::x509;

/// Owns the token and runs operations one at a time
pub struct Orchestrator<T> {
    token: T,
    dialogs: Arc<dyn Dialogs>,
    certificates: BTreeMap<String, Vec<Certificate>>,
}

impl<T: Token> Orchestrator<T> {
    pub fn new(token: T, dialogs: Arc<dyn Dialogs>) -> Self {
        Self {
            token,
            dialogs,
            certificates: BTreeMap::new(),
        }
    }

    /// Re-enumerate after a card was inserted into `reader`
    pub fn refresh(&mut self, reader: &str, atr: &[u8]) {
        info!(reader, atr = %hex::encode_upper(atr), "Refreshing certificates");
        self.certificates.remove(reader);
        if let Err(e) = self.load_all() {
            warn!(reader, error = %e, "Certificate enumeration failed");
        }
    }

    /// Forget certificates of a removed card
    ///
    /// Slot descriptions need not match PC/SC reader names; when none does,
    /// the whole cache goes and is reloaded on the next request.
    pub fn invalidate(&mut self, reader: &str) {
        if self.certificates.remove(reader).is_some() {
            debug!(reader, "Dropped cached certificates");
        } else if !self.certificates.is_empty() {
            debug!(reader, "No slot named after reader, dropping all cached certificates");
            self.certificates.clear();
        }
    }

    /// Cached certificates of all readers
    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.values().flatten()
    }

    fn load_all(&mut self) -> Result<(), PkiError> {
        let found = self.token.certificates()?;
        let mut by_reader: BTreeMap<String, Vec<Certificate>> = BTreeMap::new();
        for certificate in found {
            by_reader
                .entry(certificate.reader.clone())
                .or_default()
                .push(certificate);
        }
        self.certificates = by_reader;
        Ok(())
    }

    /// Run an operation to completion
    ///
    /// The operation is consumed; its inputs are dropped with it whatever the
    /// outcome.
    pub fn execute(&mut self, mut operation: Operation) -> Result<OperationOutput, Failure> {
        info!(context = %operation.context, id = %operation.id, kind = operation.request.name(), "Executing");

        match operation.request.clone() {
            OperationRequest::SelectCertificate { purpose } => {
                operation.advance(OperationState::SelectingCertificate);
                let certificate = self.select(&operation.origin, purpose)?;
                Ok(OperationOutput::Certificate(certificate.der))
            }
            OperationRequest::Sign {
                certificate,
                hash,
                algorithm,
            } => {
                // Reject bad input before any token call
                algorithm.check(&hash)?;
                let certificate = self.find(&certificate)?;
                let purpose = match certificate.purpose {
                    CertificatePurpose::Unknown => CertificatePurpose::Signing,
                    purpose => purpose,
                };
                let signature = self.sign(&mut operation, &certificate, purpose, algorithm, &hash)?;
                Ok(OperationOutput::Signature(signature))
            }
            OperationRequest::Authenticate { nonce } => {
                operation.advance(OperationState::Authenticating);
                let certificate = self.select(&operation.origin, CertificatePurpose::Authentication)?;
                let key_kind = x509::inspect(&certificate.der)?.key_kind;

                let input = auth_token::signing_input(
                    &certificate,
                    key_kind,
                    &operation.origin,
                    &nonce,
                    unix_time(),
                );
                let signature = self.sign(
                    &mut operation,
                    &certificate,
                    CertificatePurpose::Authentication,
                    key_kind.token_hash(),
                    &auth_token::signing_digest(&input, key_kind),
                )?;
                Ok(OperationOutput::Token(auth_token::assemble(&input, &signature)))
            }
        }
    }

    fn select(&mut self, origin: &str, purpose: CertificatePurpose) -> Result<Certificate, Failure> {
        if self.certificates.values().all(Vec::is_empty) {
            self.load_all()?;
        }

        let mut candidates: Vec<Certificate> = self
            .certificates()
            .filter(|c| c.purpose.serves(purpose))
            .cloned()
            .collect();
        debug!(origin, purpose = %purpose, count = candidates.len(), "Certificate candidates");

        match candidates.len() {
            0 => Err(Failure::NoCertificates),
            1 => Ok(candidates.remove(0)),
            _ => match self.dialogs.select_certificate(origin, &candidates, purpose)? {
                Outcome::Accepted(index) if index < candidates.len() => Ok(candidates.swap_remove(index)),
                Outcome::Accepted(index) => Err(Failure::technical(format!(
                    "certificate index {} out of range",
                    index
                ))),
                Outcome::Cancelled => Err(Failure::UserCancelled),
            },
        }
    }

    fn find(&mut self, der: &[u8]) -> Result<Certificate, Failure> {
        if let Some(certificate) = self.certificates().find(|c| c.der == der) {
            return Ok(certificate.clone());
        }
        self.load_all()?;
        self.certificates()
            .find(|c| c.der == der)
            .cloned()
            .ok_or_else(|| PkiError::UnknownCertificate.into())
    }

    /// Log in and sign, always logging out afterwards
    fn sign(
        &mut self,
        operation: &mut Operation,
        certificate: &Certificate,
        purpose: CertificatePurpose,
        algorithm: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, Failure> {
        let result = self.login_and_sign(operation, certificate, purpose, algorithm, digest);
        self.token.logout(certificate);
        result
    }

    fn login_and_sign(
        &mut self,
        operation: &mut Operation,
        certificate: &Certificate,
        purpose: CertificatePurpose,
        algorithm: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, Failure> {
        let mut last_error = None;

        loop {
            let token = self.token.token_info(certificate)?;
            if token.pin_status == PinStatus::Locked {
                warn!(token = %token.label, "PIN is locked");
                return Err(Failure::PinBlocked);
            }

            operation.advance(OperationState::AwaitingPin);
            let request = PinRequest {
                origin: &operation.origin,
                token: &token,
                purpose,
                last_error: last_error.as_ref(),
                final_try: token.pin_status == PinStatus::FinalTry,
            };
            let pin = match self.dialogs.prompt_pin(&request)? {
                Outcome::Accepted(pin) => pin,
                Outcome::Cancelled => return Err(Failure::UserCancelled),
            };

            match self.token.login(certificate, &pin) {
                Ok(()) => break,
                Err(PkiError::PinIncorrect) => {
                    warn!(token = %token.label, "Wrong PIN");
                    last_error = Some(PkiError::PinIncorrect);
                }
                Err(e) => return Err(e.into()),
            }
        }

        operation.advance(OperationState::Signing);
        Ok(self.token.sign(certificate, algorithm, digest)?)
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

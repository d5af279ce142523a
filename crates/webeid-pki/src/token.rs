//! Token capability used by the credential orchestrator

use secrecy::SecretString;
use webeid_common::{Certificate, HashAlgorithm};

use crate::error::PkiError;

/// PIN retry state reported by a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    Ok,
    /// At least one wrong PIN was entered since the last success
    CountLow,
    /// One attempt left
    FinalTry,
    Locked,
}

/// Token description shown in the PIN prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub serial: String,
    pub pin_status: PinStatus,
}

/// A source of certificates and private key operations
///
/// Every call refers to the token holding `certificate`. A successful
/// `login` stays in effect until `logout`.
pub trait Token: Send {
    /// Enumerate certificates on all present tokens
    fn certificates(&mut self) -> Result<Vec<Certificate>, PkiError>;

    fn token_info(&mut self, certificate: &Certificate) -> Result<TokenInfo, PkiError>;

    fn login(&mut self, certificate: &Certificate, pin: &SecretString) -> Result<(), PkiError>;

    /// Sign `digest`, a hash computed with `algorithm`, with the key of `certificate`
    fn sign(
        &mut self,
        certificate: &Certificate,
        algorithm: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, PkiError>;

    /// Release the login session; never fails
    fn logout(&mut self, certificate: &Certificate);
}

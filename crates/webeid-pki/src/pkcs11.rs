//! PKCS#11 token backend
//!
//! Loads the PKCS#11 module on first use and keeps one logged-in session per
//! slot between `login` and `logout`.

use std::collections::HashMap;
use std::path::PathBuf;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, CertificateType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use webeid_common::{Certificate, HashAlgorithm};

use crate::error::PkiError;
use crate::token::{PinStatus, Token, TokenInfo};
use crate::x509::{self, KeyKind};

/// DER prefix of a PKCS#1 DigestInfo for each hash algorithm
fn digest_info_prefix(algorithm: HashAlgorithm) -> &'static [u8] {
    match algorithm {
        HashAlgorithm::Sha224 => &[
            0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x04, 0x05, 0x00, 0x04, 0x1c,
        ],
        HashAlgorithm::Sha256 => &[
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x01, 0x05, 0x00, 0x04, 0x20,
        ],
        HashAlgorithm::Sha384 => &[
            0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x02, 0x05, 0x00, 0x04, 0x30,
        ],
        HashAlgorithm::Sha512 => &[
            0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
            0x03, 0x05, 0x00, 0x04, 0x40,
        ],
    }
}

/// Wrap a digest in a DigestInfo, the input of CKM_RSA_PKCS
pub fn digest_info(algorithm: HashAlgorithm, digest: &[u8]) -> Vec<u8> {
    let prefix = digest_info_prefix(algorithm);
    let mut out = Vec::with_capacity(prefix.len() + digest.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(digest);
    out
}

/// Token backed by a PKCS#11 module
pub struct Pkcs11Token {
    module: PathBuf,
    pkcs11: Option<Pkcs11>,
    sessions: HashMap<u64, Session>,
}

impl Pkcs11Token {
    pub fn new(module: impl Into<PathBuf>) -> Self {
        Self {
            module: module.into(),
            pkcs11: None,
            sessions: HashMap::new(),
        }
    }

    fn context(&mut self) -> Result<Pkcs11, PkiError> {
        if let Some(pkcs11) = &self.pkcs11 {
            return Ok(pkcs11.clone());
        }

        info!(module = %self.module.display(), "Loading PKCS#11 module");
        let pkcs11 = Pkcs11::new(&self.module)?;
        pkcs11.initialize(CInitializeArgs::OsThreads)?;
        self.pkcs11 = Some(pkcs11.clone());
        Ok(pkcs11)
    }

    fn slot(&mut self, slot_id: u64) -> Result<(Pkcs11, Slot), PkiError> {
        let pkcs11 = self.context()?;
        let slot = pkcs11
            .get_slots_with_token()?
            .into_iter()
            .find(|slot| slot.id() == slot_id)
            .ok_or(PkiError::TokenRemoved)?;
        Ok((pkcs11, slot))
    }

    fn private_key(session: &Session, certificate: &Certificate) -> Result<ObjectHandle, PkiError> {
        session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Id(certificate.object_id.clone()),
            ])?
            .into_iter()
            .next()
            .ok_or(PkiError::KeyNotFound)
    }

    fn slot_certificates(pkcs11: &Pkcs11, slot: Slot) -> Result<Vec<Certificate>, PkiError> {
        let reader = pkcs11
            .get_slot_info(slot)?
            .slot_description()
            .trim()
            .to_string();
        let session = pkcs11.open_ro_session(slot)?;

        let handles = session.find_objects(&[
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
        ])?;

        let mut certificates = Vec::new();
        for handle in handles {
            let mut der = None;
            let mut object_id = Vec::new();
            for attribute in session.get_attributes(handle, &[AttributeType::Value, AttributeType::Id])? {
                match attribute {
                    Attribute::Value(value) => der = Some(value),
                    Attribute::Id(id) => object_id = id,
                    _ => {}
                }
            }
            let Some(der) = der else { continue };

            match x509::inspect(&der) {
                Ok(details) => certificates.push(Certificate {
                    der,
                    slot_id: slot.id(),
                    object_id,
                    reader: reader.clone(),
                    subject: details.subject,
                    purpose: details.purpose,
                }),
                Err(e) => warn!(reader = %reader, error = %e, "Skipping unreadable certificate"),
            }
        }

        debug!(reader = %reader, count = certificates.len(), "Enumerated certificates");
        Ok(certificates)
    }
}

impl Token for Pkcs11Token {
    fn certificates(&mut self) -> Result<Vec<Certificate>, PkiError> {
        let pkcs11 = self.context()?;
        let mut certificates = Vec::new();
        for slot in pkcs11.get_slots_with_token()? {
            match Self::slot_certificates(&pkcs11, slot) {
                Ok(found) => certificates.extend(found),
                // The card may leave while we walk the slots
                Err(PkiError::TokenRemoved) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(certificates)
    }

    fn token_info(&mut self, certificate: &Certificate) -> Result<TokenInfo, PkiError> {
        let (pkcs11, slot) = self.slot(certificate.slot_id)?;
        let info = pkcs11.get_token_info(slot)?;

        let pin_status = if info.user_pin_locked() {
            PinStatus::Locked
        } else if info.user_pin_final_try() {
            PinStatus::FinalTry
        } else if info.user_pin_count_low() {
            PinStatus::CountLow
        } else {
            PinStatus::Ok
        };

        Ok(TokenInfo {
            label: info.label().trim().to_string(),
            serial: info.serial_number().trim().to_string(),
            pin_status,
        })
    }

    fn login(&mut self, certificate: &Certificate, pin: &SecretString) -> Result<(), PkiError> {
        let (pkcs11, slot) = self.slot(certificate.slot_id)?;
        let session = pkcs11.open_ro_session(slot)?;
        session.login(UserType::User, Some(&AuthPin::new(pin.expose_secret().clone())))?;
        debug!(slot = certificate.slot_id, "Logged in");
        self.sessions.insert(certificate.slot_id, session);
        Ok(())
    }

    fn sign(
        &mut self,
        certificate: &Certificate,
        algorithm: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, PkiError> {
        let session = self
            .sessions
            .get(&certificate.slot_id)
            .ok_or(PkiError::NotLoggedIn)?;
        let key = Self::private_key(session, certificate)?;

        let signature = match x509::inspect(&certificate.der)?.key_kind {
            KeyKind::Rsa => session.sign(&Mechanism::RsaPkcs, key, &digest_info(algorithm, digest))?,
            KeyKind::Ec(_) => session.sign(&Mechanism::Ecdsa, key, digest)?,
        };
        debug!(slot = certificate.slot_id, hash = algorithm.name(), "Signed");
        Ok(signature)
    }

    fn logout(&mut self, certificate: &Certificate) {
        if let Some(session) = self.sessions.remove(&certificate.slot_id) {
            if let Err(e) = session.logout() {
                debug!(slot = certificate.slot_id, error = %e, "C_Logout failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::Pkcs1v15Sign;
    use sha2::{Sha224, Sha256, Sha384, Sha512};

    #[test]
    fn test_digest_info_prefixes() {
        let cases = [
            (HashAlgorithm::Sha224, Pkcs1v15Sign::new::<Sha224>()),
            (HashAlgorithm::Sha256, Pkcs1v15Sign::new::<Sha256>()),
            (HashAlgorithm::Sha384, Pkcs1v15Sign::new::<Sha384>()),
            (HashAlgorithm::Sha512, Pkcs1v15Sign::new::<Sha512>()),
        ];
        for (algorithm, scheme) in cases {
            assert_eq!(digest_info_prefix(algorithm), &*scheme.prefix);
        }
    }

    #[test]
    fn test_digest_info_appends_hash() {
        let digest = [0xAB; 32];
        let wrapped = digest_info(HashAlgorithm::Sha256, &digest);
        assert_eq!(wrapped.len(), 19 + 32);
        assert!(wrapped.ends_with(&digest));
    }

    #[test]
    fn test_missing_module_is_token_error() {
        let mut token = Pkcs11Token::new("/nonexistent/pkcs11.so");
        assert!(matches!(token.certificates(), Err(PkiError::Token(_))));
    }
}

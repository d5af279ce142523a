//! In-memory token and scripted dialogs for tests

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use secrecy::{ExposeSecret, SecretString};
use webeid_common::{Certificate, CertificatePurpose, HashAlgorithm};

use crate::dialogs::{Dialogs, Outcome, PinRequest};
use crate::error::PkiError;
use crate::pkcs11::digest_info;
use crate::token::{PinStatus, Token, TokenInfo};
use crate::x509;

pub const CORRECT_PIN: &str = "1234";

#[derive(Clone)]
pub enum FakeKey {
    Rsa(RsaPrivateKey),
    Ec(SigningKey),
    P384(p384::ecdsa::SigningKey),
}

#[derive(Clone)]
pub struct Fixture {
    pub certificate: Certificate,
    pub key: FakeKey,
}

/// Certificate and key pair from `tests/data`
pub fn fixture(name: &str) -> Fixture {
    let (der, key): (&[u8], &[u8]) = match name {
        "sign" => (
            include_bytes!("../tests/data/sign.der"),
            include_bytes!("../tests/data/sign.key.der"),
        ),
        "auth" => (
            include_bytes!("../tests/data/auth.der"),
            include_bytes!("../tests/data/auth.key.der"),
        ),
        "auth384" => (
            include_bytes!("../tests/data/auth384.der"),
            include_bytes!("../tests/data/auth384.key.der"),
        ),
        "plain" => (
            include_bytes!("../tests/data/plain.der"),
            include_bytes!("../tests/data/plain.key.der"),
        ),
        other => panic!("no fixture {}", other),
    };

    let details = x509::inspect(der).unwrap();
    let key = match details.key_kind {
        x509::KeyKind::Rsa => FakeKey::Rsa(RsaPrivateKey::from_pkcs8_der(key).unwrap()),
        x509::KeyKind::Ec(x509::Curve::P256) => FakeKey::Ec(SigningKey::from_pkcs8_der(key).unwrap()),
        x509::KeyKind::Ec(x509::Curve::P384) => {
            FakeKey::P384(p384::ecdsa::SigningKey::from_pkcs8_der(key).unwrap())
        }
    };

    Fixture {
        certificate: Certificate {
            der: der.to_vec(),
            slot_id: 0,
            object_id: name.as_bytes().to_vec(),
            reader: "Reader 0".into(),
            subject: details.subject,
            purpose: details.purpose,
        },
        key,
    }
}

/// Token with a PIN retry counter
pub struct FakeToken {
    fixtures: Vec<Fixture>,
    max_retries: u8,
    retries: u8,
    logged_in: bool,
    log: Arc<Mutex<Vec<String>>>,
    pins: Arc<Mutex<Vec<SecretString>>>,
}

impl FakeToken {
    pub fn new(fixtures: Vec<Fixture>, retries: u8) -> Self {
        Self {
            fixtures,
            max_retries: retries,
            retries,
            logged_in: false,
            log: Arc::default(),
            pins: Arc::default(),
        }
    }

    /// Names of the login/sign/logout calls made so far
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    /// PINs passed to successful logins
    pub fn pins_seen(&self) -> Arc<Mutex<Vec<SecretString>>> {
        self.pins.clone()
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(call.to_string());
    }
}

impl Token for FakeToken {
    fn certificates(&mut self) -> Result<Vec<Certificate>, PkiError> {
        Ok(self.fixtures.iter().map(|f| f.certificate.clone()).collect())
    }

    fn token_info(&mut self, _certificate: &Certificate) -> Result<TokenInfo, PkiError> {
        let pin_status = match self.retries {
            0 => PinStatus::Locked,
            1 => PinStatus::FinalTry,
            n if n < self.max_retries => PinStatus::CountLow,
            _ => PinStatus::Ok,
        };
        Ok(TokenInfo {
            label: "Test Token".into(),
            serial: "0001".into(),
            pin_status,
        })
    }

    fn login(&mut self, _certificate: &Certificate, pin: &SecretString) -> Result<(), PkiError> {
        self.record("login");
        if self.retries == 0 {
            return Err(PkiError::PinLocked);
        }
        if pin.expose_secret() != CORRECT_PIN {
            self.retries -= 1;
            return Err(PkiError::PinIncorrect);
        }
        self.retries = self.max_retries;
        self.logged_in = true;
        self.pins.lock().unwrap().push(pin.clone());
        Ok(())
    }

    fn sign(
        &mut self,
        certificate: &Certificate,
        algorithm: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, PkiError> {
        self.record("sign");
        if !self.logged_in {
            return Err(PkiError::NotLoggedIn);
        }
        let fixture = self
            .fixtures
            .iter()
            .find(|f| f.certificate.der == certificate.der)
            .ok_or(PkiError::KeyNotFound)?;

        match &fixture.key {
            FakeKey::Rsa(key) => key
                .sign(Pkcs1v15Sign::new_unprefixed(), &digest_info(algorithm, digest))
                .map_err(|e| PkiError::Token(e.to_string())),
            FakeKey::Ec(key) => {
                let signature: Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| PkiError::Token(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
            FakeKey::P384(key) => {
                let signature: p384::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| PkiError::Token(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
        }
    }

    fn logout(&mut self, _certificate: &Certificate) {
        self.record("logout");
        self.logged_in = false;
    }
}

/// What a PIN prompt was shown with
#[derive(Debug, Clone)]
pub struct PromptRecord {
    pub purpose: CertificatePurpose,
    pub final_try: bool,
    pub retry: bool,
}

/// Dialogs answering from a script; an exhausted PIN script cancels
#[derive(Default)]
pub struct ScriptedDialogs {
    pins: Mutex<VecDeque<String>>,
    choice: Mutex<Option<Outcome<usize>>>,
    prompts: Mutex<Vec<PromptRecord>>,
    selections: Mutex<usize>,
}

impl ScriptedDialogs {
    pub fn pins(self, pins: &[&str]) -> Self {
        *self.pins.lock().unwrap() = pins.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn choose(self, outcome: Outcome<usize>) -> Self {
        *self.choice.lock().unwrap() = Some(outcome);
        self
    }

    pub fn prompts(&self) -> Vec<PromptRecord> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn selections(&self) -> usize {
        *self.selections.lock().unwrap()
    }
}

impl Dialogs for ScriptedDialogs {
    fn prompt_pin(&self, request: &PinRequest<'_>) -> Result<Outcome<SecretString>, PkiError> {
        self.prompts.lock().unwrap().push(PromptRecord {
            purpose: request.purpose,
            final_try: request.final_try,
            retry: request.last_error.is_some(),
        });
        Ok(match self.pins.lock().unwrap().pop_front() {
            Some(pin) => Outcome::Accepted(SecretString::new(pin)),
            None => Outcome::Cancelled,
        })
    }

    fn select_certificate(
        &self,
        _origin: &str,
        _candidates: &[Certificate],
        _purpose: CertificatePurpose,
    ) -> Result<Outcome<usize>, PkiError> {
        *self.selections.lock().unwrap() += 1;
        Ok(self.choice.lock().unwrap().clone().unwrap_or(Outcome::Cancelled))
    }

    fn notify_reader_busy(&self, _origin: &str, _reader: &str, _open: &AtomicBool) -> bool {
        false
    }
}

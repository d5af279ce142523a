//! Authentication tokens
//!
//! Authentication signs a small JWS document binding the certificate, the
//! pinned origin and the caller's nonce. The document is built with sorted
//! keys so it only depends on its inputs.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::ecdsa::signature::Verifier;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha384};
use webeid_common::{Certificate, HashAlgorithm, VERSION};

use crate::error::PkiError;
use crate::x509::{self, Curve, KeyKind};

/// Seconds a token stays valid after issuing
pub const TOKEN_LIFETIME: u64 = 300;

/// Header and payload of a token, joined as the JWS signing input
pub fn signing_input(
    certificate: &Certificate,
    key_kind: KeyKind,
    origin: &str,
    nonce: &str,
    issued_at: u64,
) -> String {
    let header = json!({
        "alg": key_kind.jws_algorithm(),
        "typ": "JWT",
        "x5c": [STANDARD.encode(&certificate.der)],
    });
    let payload = json!({
        "aud": [origin],
        "exp": issued_at + TOKEN_LIFETIME,
        "iat": issued_at,
        "iss": format!("web-eid app {}", VERSION),
        "nonce": nonce,
        "sub": certificate.subject,
    });

    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

/// Hash of the signing input for `key_kind`, the value handed to the token
pub fn signing_digest(signing_input: &str, key_kind: KeyKind) -> Vec<u8> {
    match key_kind.token_hash() {
        HashAlgorithm::Sha384 => Sha384::digest(signing_input.as_bytes()).to_vec(),
        _ => Sha256::digest(signing_input.as_bytes()).to_vec(),
    }
}

/// Append the signature to complete a compact JWS
pub fn assemble(signing_input: &str, signature: &[u8]) -> String {
    format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature))
}

/// Public key checking token signatures
#[derive(Debug, Clone)]
pub enum VerifyingKey {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl VerifyingKey {
    pub fn from_certificate(der: &[u8]) -> Result<Self, PkiError> {
        let details = x509::inspect(der)?;
        match details.key_kind {
            KeyKind::Rsa => RsaPublicKey::from_pkcs1_der(&details.public_key)
                .map(VerifyingKey::Rsa)
                .map_err(|e| PkiError::Certificate(e.to_string())),
            KeyKind::Ec(Curve::P256) => p256::ecdsa::VerifyingKey::from_sec1_bytes(&details.public_key)
                .map(VerifyingKey::P256)
                .map_err(|e| PkiError::Certificate(e.to_string())),
            KeyKind::Ec(Curve::P384) => p384::ecdsa::VerifyingKey::from_sec1_bytes(&details.public_key)
                .map(VerifyingKey::P384)
                .map_err(|e| PkiError::Certificate(e.to_string())),
        }
    }

    /// JWS algorithm a token checked by this key must declare
    pub fn jws_algorithm(&self) -> &'static str {
        match self {
            VerifyingKey::Rsa(_) => KeyKind::Rsa.jws_algorithm(),
            VerifyingKey::P256(_) => KeyKind::Ec(Curve::P256).jws_algorithm(),
            VerifyingKey::P384(_) => KeyKind::Ec(Curve::P384).jws_algorithm(),
        }
    }

    fn verify(&self, input: &[u8], signature: &[u8]) -> Result<(), PkiError> {
        let invalid = |e: String| PkiError::InvalidToken(format!("bad signature: {}", e));
        match self {
            VerifyingKey::Rsa(key) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(input), signature)
                .map_err(|e| invalid(e.to_string())),
            VerifyingKey::P256(key) => {
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|e| invalid(e.to_string()))?;
                key.verify(input, &signature).map_err(|e| invalid(e.to_string()))
            }
            VerifyingKey::P384(key) => {
                let signature = p384::ecdsa::Signature::from_slice(signature)
                    .map_err(|e| invalid(e.to_string()))?;
                key.verify(input, &signature).map_err(|e| invalid(e.to_string()))
            }
        }
    }
}

fn decode_part(part: &str) -> Result<Vec<u8>, PkiError> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| PkiError::InvalidToken(e.to_string()))
}

/// Check a token against the origin and nonce it must be bound to
///
/// Returns the payload on success.
pub fn verify(token: &str, key: &VerifyingKey, origin: &str, nonce: &str) -> Result<Value, PkiError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(PkiError::InvalidToken("expected three parts".into()));
    };

    let header: Value = serde_json::from_slice(&decode_part(header)?)
        .map_err(|e| PkiError::InvalidToken(e.to_string()))?;
    if header["alg"] != json!(key.jws_algorithm()) {
        return Err(PkiError::InvalidToken(format!(
            "algorithm {} does not match the {} key",
            header["alg"],
            key.jws_algorithm()
        )));
    }

    let signing_input = &token[..token.len() - signature.len() - 1];
    key.verify(signing_input.as_bytes(), &decode_part(signature)?)?;

    let payload: Value = serde_json::from_slice(&decode_part(payload)?)
        .map_err(|e| PkiError::InvalidToken(e.to_string()))?;

    if payload["aud"] != json!([origin]) {
        return Err(PkiError::InvalidToken("audience mismatch".into()));
    }
    if payload["nonce"] != json!(nonce) {
        return Err(PkiError::InvalidToken("nonce mismatch".into()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::pkcs8::DecodePrivateKey;
    use webeid_common::CertificatePurpose;

    const AUTH_CERT: &[u8] = include_bytes!("../tests/data/auth.der");
    const AUTH_KEY: &[u8] = include_bytes!("../tests/data/auth.key.der");
    const AUTH384_CERT: &[u8] = include_bytes!("../tests/data/auth384.der");
    const AUTH384_KEY: &[u8] = include_bytes!("../tests/data/auth384.key.der");
    const P256: KeyKind = KeyKind::Ec(Curve::P256);

    fn certificate() -> Certificate {
        Certificate {
            der: AUTH_CERT.to_vec(),
            slot_id: 0,
            object_id: vec![1],
            reader: "Reader 0".into(),
            subject: "MÄNNIK,MARI-LIIS,61709210125".into(),
            purpose: CertificatePurpose::Authentication,
        }
    }

    fn issue(origin: &str, nonce: &str) -> String {
        let input = signing_input(&certificate(), P256, origin, nonce, 1_700_000_000);
        let key = SigningKey::from_pkcs8_der(AUTH_KEY).unwrap();
        let signature: Signature = key.sign_prehash(&signing_digest(&input, P256)).unwrap();
        assemble(&input, &signature.to_bytes())
    }

    fn issue_p384(origin: &str, nonce: &str) -> String {
        let kind = KeyKind::Ec(Curve::P384);
        let mut cert = certificate();
        cert.der = AUTH384_CERT.to_vec();
        let input = signing_input(&cert, kind, origin, nonce, 1_700_000_000);
        let key = p384::ecdsa::SigningKey::from_pkcs8_der(AUTH384_KEY).unwrap();
        let signature: p384::ecdsa::Signature = key.sign_prehash(&signing_digest(&input, kind)).unwrap();
        assemble(&input, &signature.to_bytes())
    }

    #[test]
    fn test_document_binds_origin_and_nonce() {
        let cert = certificate();
        let base = signing_input(&cert, P256, "https://example.com", "abc", 1);
        assert_eq!(base, signing_input(&cert, P256, "https://example.com", "abc", 1));
        assert_ne!(base, signing_input(&cert, P256, "https://example.org", "abc", 1));
        assert_ne!(base, signing_input(&cert, P256, "https://example.com", "abd", 1));
    }

    #[test]
    fn test_payload_fields() {
        let input = signing_input(&certificate(), KeyKind::Rsa, "https://example.com", "abc", 100);
        let (header, payload) = input.split_once('.').unwrap();
        let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).unwrap()).unwrap();
        let payload: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();

        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["x5c"][0], STANDARD.encode(AUTH_CERT));
        assert_eq!(payload["exp"], 100 + TOKEN_LIFETIME);
        assert_eq!(payload["sub"], "MÄNNIK,MARI-LIIS,61709210125");
        assert!(payload["iss"].as_str().unwrap().starts_with("web-eid app "));
    }

    #[test]
    fn test_verify_accepts_matching_token() {
        let key = VerifyingKey::from_certificate(AUTH_CERT).unwrap();
        let token = issue("https://example.com", "abc");
        let payload = verify(&token, &key, "https://example.com", "abc").unwrap();
        assert_eq!(payload["nonce"], "abc");
    }

    #[test]
    fn test_p384_token_is_es384() {
        let key = VerifyingKey::from_certificate(AUTH384_CERT).unwrap();
        assert_eq!(key.jws_algorithm(), "ES384");

        let token = issue_p384("https://example.com", "abc");
        let header: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(token.split('.').next().unwrap()).unwrap())
                .unwrap();
        assert_eq!(header["alg"], "ES384");
        assert_eq!(URL_SAFE_NO_PAD.decode(token.rsplit('.').next().unwrap()).unwrap().len(), 96);

        let payload = verify(&token, &key, "https://example.com", "abc").unwrap();
        assert_eq!(payload["nonce"], "abc");
        assert!(verify(&token, &key, "https://example.com", "abd").is_err());
    }

    #[test]
    fn test_verify_rejects_algorithm_mismatch() {
        // A P-256 token checked with the P-384 key
        let key = VerifyingKey::from_certificate(AUTH384_CERT).unwrap();
        let token = issue("https://example.com", "abc");
        assert!(matches!(
            verify(&token, &key, "https://example.com", "abc"),
            Err(PkiError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_verify_rejects_replay() {
        let key = VerifyingKey::from_certificate(AUTH_CERT).unwrap();
        let token = issue("https://example.com", "abc");
        assert!(verify(&token, &key, "https://example.com", "xyz").is_err());
        assert!(verify(&token, &key, "https://evil.example", "abc").is_err());
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let key = VerifyingKey::from_certificate(AUTH_CERT).unwrap();
        let token = issue("https://example.com", "abc");
        let forged_payload = URL_SAFE_NO_PAD.encode(
            json!({"aud": ["https://example.com"], "nonce": "xyz"}).to_string(),
        );
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_payload;
        let forged = parts.join(".");
        assert!(matches!(
            verify(&forged, &key, "https://example.com", "xyz"),
            Err(PkiError::InvalidToken(_))
        ));
    }
}

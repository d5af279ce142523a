//! X.509 certificate inspection
//!
//! Only what the host needs from a certificate: the subject common name for
//! display, the purpose from the key usage extension and the public key.

use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use x509_cert::ext::pkix::KeyUsage;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::Certificate as X509Certificate;

use webeid_common::{CertificatePurpose, HashAlgorithm};

use crate::error::PkiError;

const KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Named curve of an EC key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P256,
    P384,
}

/// Type of the key pair behind a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ec(Curve),
}

impl KeyKind {
    /// JWS algorithm of authentication tokens signed with this key
    pub fn jws_algorithm(&self) -> &'static str {
        match self {
            KeyKind::Rsa => "RS256",
            KeyKind::Ec(Curve::P256) => "ES256",
            KeyKind::Ec(Curve::P384) => "ES384",
        }
    }

    /// Hash paired with the key in [`jws_algorithm`](Self::jws_algorithm)
    pub fn token_hash(&self) -> HashAlgorithm {
        match self {
            KeyKind::Rsa | KeyKind::Ec(Curve::P256) => HashAlgorithm::Sha256,
            KeyKind::Ec(Curve::P384) => HashAlgorithm::Sha384,
        }
    }
}

/// Fields extracted from a DER certificate
#[derive(Debug, Clone)]
pub struct CertificateDetails {
    pub subject: String,
    pub purpose: CertificatePurpose,
    pub key_kind: KeyKind,
    /// PKCS#1 RSAPublicKey for RSA, SEC1 point for EC
    pub public_key: Vec<u8>,
}

/// Parse a DER certificate
pub fn inspect(der: &[u8]) -> Result<CertificateDetails, PkiError> {
    let certificate = X509Certificate::from_der(der)?;
    let tbs = &certificate.tbs_certificate;

    let spki = &tbs.subject_public_key_info;
    let key_kind = if spki.algorithm.oid == RSA_ENCRYPTION {
        KeyKind::Rsa
    } else if spki.algorithm.oid == EC_PUBLIC_KEY {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| PkiError::Certificate("EC key without curve".into()))?;
        KeyKind::Ec(named_curve(&ObjectIdentifier::from_der(&curve.to_der()?)?)?)
    } else {
        return Err(PkiError::Certificate(format!(
            "unsupported key algorithm {}",
            spki.algorithm.oid
        )));
    };

    Ok(CertificateDetails {
        subject: common_name(&tbs.subject).unwrap_or_else(|| tbs.subject.to_string()),
        purpose: purpose(tbs.extensions.as_deref().unwrap_or(&[]))?,
        key_kind,
        public_key: spki.subject_public_key.raw_bytes().to_vec(),
    })
}

fn named_curve(oid: &ObjectIdentifier) -> Result<Curve, PkiError> {
    if *oid == SECP256R1 {
        Ok(Curve::P256)
    } else if *oid == SECP384R1 {
        Ok(Curve::P384)
    } else {
        Err(PkiError::Certificate(format!("unsupported curve {}", oid)))
    }
}

fn purpose(extensions: &[Extension]) -> Result<CertificatePurpose, PkiError> {
    let Some(extension) = extensions.iter().find(|e| e.extn_id == KEY_USAGE) else {
        return Ok(CertificatePurpose::Unknown);
    };
    let usage = KeyUsage::from_der(extension.extn_value.as_bytes())?;

    Ok(if usage.non_repudiation() {
        CertificatePurpose::Signing
    } else if usage.digital_signature() {
        CertificatePurpose::Authentication
    } else {
        CertificatePurpose::Unknown
    })
}

fn common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == COMMON_NAME)
        .map(|atv| String::from_utf8_lossy(atv.value.value()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGN_CERT: &[u8] = include_bytes!("../tests/data/sign.der");
    const AUTH_CERT: &[u8] = include_bytes!("../tests/data/auth.der");
    const PLAIN_CERT: &[u8] = include_bytes!("../tests/data/plain.der");
    const AUTH384_CERT: &[u8] = include_bytes!("../tests/data/auth384.der");

    #[test]
    fn test_non_repudiation_is_signing() {
        let details = inspect(SIGN_CERT).unwrap();
        assert_eq!(details.purpose, CertificatePurpose::Signing);
        assert_eq!(details.key_kind, KeyKind::Rsa);
        assert_eq!(details.subject, "MÄNNIK,MARI-LIIS,61709210125");
    }

    #[test]
    fn test_digital_signature_is_authentication() {
        let details = inspect(AUTH_CERT).unwrap();
        assert_eq!(details.purpose, CertificatePurpose::Authentication);
        assert_eq!(details.key_kind, KeyKind::Ec(Curve::P256));
        assert_eq!(details.public_key.len(), 65);
    }

    #[test]
    fn test_curve_is_read_from_key_parameters() {
        let details = inspect(AUTH384_CERT).unwrap();
        assert_eq!(details.key_kind, KeyKind::Ec(Curve::P384));
        assert_eq!(details.key_kind.jws_algorithm(), "ES384");
        assert_eq!(details.key_kind.token_hash(), HashAlgorithm::Sha384);
        assert_eq!(details.public_key.len(), 97);
        assert_eq!(details.purpose, CertificatePurpose::Authentication);
    }

    #[test]
    fn test_unknown_curve_is_rejected() {
        let secp521r1 = ObjectIdentifier::new_unwrap("1.3.132.0.35");
        assert!(matches!(named_curve(&secp521r1), Err(PkiError::Certificate(_))));
    }

    #[test]
    fn test_missing_key_usage_is_unknown() {
        let details = inspect(PLAIN_CERT).unwrap();
        assert_eq!(details.purpose, CertificatePurpose::Unknown);
        assert_eq!(details.subject, "Test Token");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            inspect(&[0x30, 0x03, 0x02, 0x01]),
            Err(PkiError::Certificate(_))
        ));
    }
}

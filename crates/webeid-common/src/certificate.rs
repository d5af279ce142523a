//! Certificates found on tokens

use std::fmt;
use std::str::FromStr;

use crate::Failure;

/// What a certificate may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificatePurpose {
    Authentication,
    Signing,
    Unknown,
}

impl CertificatePurpose {
    /// Whether a certificate of this purpose may serve a request for `wanted`
    ///
    /// Certificates without a recognisable key usage are eligible for both.
    pub fn serves(&self, wanted: CertificatePurpose) -> bool {
        *self == wanted || *self == CertificatePurpose::Unknown
    }
}

impl FromStr for CertificatePurpose {
    type Err = Failure;

    /// Parse the `filter` field of a CERT request
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTH" => Ok(CertificatePurpose::Authentication),
            "SIGN" => Ok(CertificatePurpose::Signing),
            other => Err(Failure::InvalidArgument(format!(
                "unknown certificate filter {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for CertificatePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificatePurpose::Authentication => "authentication",
            CertificatePurpose::Signing => "signing",
            CertificatePurpose::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A certificate enumerated from a PKCS#11 token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Raw DER encoding
    pub der: Vec<u8>,
    /// PKCS#11 slot holding the token
    pub slot_id: u64,
    /// CKA_ID shared by the certificate and its private key
    pub object_id: Vec<u8>,
    /// Reader the token sits in (slot description)
    pub reader: String,
    /// Human readable subject, used by the certificate picker
    pub subject: String,
    /// Usage derived from the key usage extension
    pub purpose: CertificatePurpose,
}

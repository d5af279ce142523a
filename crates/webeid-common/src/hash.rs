//! Hash algorithms accepted for SIGN requests

use std::str::FromStr;

use crate::Failure;

/// Hash algorithm of a document hash supplied by the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Length of a digest in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha224 => "SHA-224",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Check that `hash` has the length this algorithm produces
    pub fn check(&self, hash: &[u8]) -> Result<(), Failure> {
        if hash.len() != self.digest_len() {
            return Err(Failure::InvalidArgument(format!(
                "{} hash must be {} bytes, got {}",
                self.name(),
                self.digest_len(),
                hash.len()
            )));
        }
        Ok(())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Failure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA-224" => Ok(HashAlgorithm::Sha224),
            "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA-384" => Ok(HashAlgorithm::Sha384),
            "SHA-512" => Ok(HashAlgorithm::Sha512),
            other => Err(Failure::InvalidArgument(format!(
                "unsupported hash algorithm {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for alg in [
            HashAlgorithm::Sha224,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(alg.name().parse::<HashAlgorithm>().unwrap(), alg);
        }
        assert!("MD5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_check_length() {
        assert!(HashAlgorithm::Sha256.check(&[0u8; 32]).is_ok());
        let err = HashAlgorithm::Sha256.check(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, Failure::InvalidArgument(_)));
    }
}

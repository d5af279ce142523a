//! Origin validation

use url::Url;
use webeid_common::Failure;

/// A validated browser origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Origin exactly as claimed by the first message
    pub value: String,
    /// Label shown to the user
    pub friendly: String,
}

impl Origin {
    /// Accept `https`, `file` and localhost origins
    pub fn parse(claim: &str) -> Result<Self, Failure> {
        let url = Url::parse(claim).map_err(|_| Failure::NotAllowed(claim.to_string()))?;

        let friendly = match (url.scheme(), url.host_str()) {
            ("file", _) => "localhost".to_string(),
            ("https", Some(host)) => host.to_string(),
            (_, Some("localhost")) => "localhost".to_string(),
            _ => return Err(Failure::NotAllowed(claim.to_string())),
        };

        Ok(Self {
            value: claim.to_string(),
            friendly,
        })
    }
}

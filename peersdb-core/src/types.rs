use crate::{PeersError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const CONTENT_PREFIX: &str = "/content/";

/// Identity of a node on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identity.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The private inbox topic of this peer.
    pub fn inbox_topic(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locator of immutable content: `/content/<sha256 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentRef {
    digest: String,
}

impl ContentRef {
    pub fn from_digest(digest: &str) -> Result<Self> {
        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PeersError::InvalidRequest(format!(
                "invalid content digest: {}",
                digest
            )));
        }
        Ok(Self { digest })
    }

    /// Accepts either the full locator or the bare digest.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let digest = value.strip_prefix(CONTENT_PREFIX).unwrap_or(value);
        Self::from_digest(digest)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CONTENT_PREFIX, self.digest)
    }
}

impl TryFrom<String> for ContentRef {
    type Error = PeersError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentRef> for String {
    fn from(value: ContentRef) -> Self {
        value.to_string()
    }
}

/// An entry of the public Contributions log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Contribution {
    pub content_ref: ContentRef,
    pub contributor: PeerId,
    pub created_at: DateTime<Utc>,
}

impl Contribution {
    pub fn new(content_ref: ContentRef, contributor: PeerId) -> Self {
        Self {
            content_ref,
            contributor,
            created_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Local validity opinion about a piece of content.
///
/// `vote_count == 0` marks a self-determined record; anything above is the
/// number of peer votes the quorum round observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub content_ref: ContentRef,
    pub is_valid: bool,
    pub vote_count: u32,
}

impl ValidationRecord {
    pub fn self_determined(content_ref: ContentRef, is_valid: bool) -> Self {
        Self {
            content_ref,
            is_valid,
            vote_count: 0,
        }
    }

    pub fn is_self_determined(&self) -> bool {
        self.vote_count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRequest {
    pub content_ref: ContentRef,
    pub requester: PeerId,
}

impl ValidationRequest {
    /// Topic on which votes for this request are expected.
    pub fn reply_topic(&self) -> String {
        reply_topic(&self.requester, &self.content_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationVote {
    pub vote: bool,
}

/// Sent to a newly connected peer's inbox to share the Contributions log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreAdvertisement {
    pub peer_id: PeerId,
    pub log_address: String,
}

pub fn reply_topic(requester: &PeerId, content_ref: &ContentRef) -> String {
    format!("{}{}", requester, content_ref)
}

/// Decode a wire message, rejecting anything that does not match its schema.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_content_ref_parse_forms() {
        let full = ContentRef::parse(&format!("/content/{}", DIGEST)).unwrap();
        let bare = ContentRef::parse(&DIGEST.to_uppercase()).unwrap();
        assert_eq!(full, bare);
        assert_eq!(full.to_string(), format!("/content/{}", DIGEST));

        assert!(ContentRef::parse("/content/abc").is_err());
        assert!(ContentRef::parse("/ipfs/QmSomething").is_err());
    }

    #[test]
    fn test_contribution_rejects_unknown_shape() {
        let contribution = Contribution::new(
            ContentRef::from_digest(DIGEST).unwrap(),
            PeerId::new("peer-a"),
        );
        let decoded = Contribution::decode(&contribution.encode().unwrap()).unwrap();
        assert_eq!(decoded, contribution);

        let foreign = br#"{"key":"x","value":[1,2,3]}"#;
        assert!(Contribution::decode(foreign).is_err());
    }

    #[test]
    fn test_validation_request_reply_topic() {
        let request = ValidationRequest {
            content_ref: ContentRef::from_digest(DIGEST).unwrap(),
            requester: PeerId::new("peer-a"),
        };
        assert_eq!(request.reply_topic(), format!("peer-a/content/{}", DIGEST));

        let vote: std::result::Result<ValidationVote, _> =
            serde_json::from_slice(br#"{"vote":true,"weight":3}"#);
        assert!(vote.is_err());
    }
}

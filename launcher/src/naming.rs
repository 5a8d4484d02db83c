//! Derive collision-free child stack names.
//!
//! A name is `<prefix>-<token>`, where `token` is the hex encoding of the first
//! [TOKEN_BYTES] bytes of `SHA-256(prefix || 0x00 || request_id)`. Fresh invocations use a
//! random [RequestId] (and therefore a fresh token), while retries that reuse a request id
//! resolve to the same name, even across process restarts. The request id is never
//! embedded verbatim.

use crate::{request::RequestId, Error};
use commonware_utils::hex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of digest bytes embedded in a name.
pub const TOKEN_BYTES: usize = 16;

/// Maximum length of a stack name accepted by the deployment backend.
pub const MAX_NAME_LEN: usize = 128;

/// Maximum length of a [Prefix] (leaves room for the separator and token).
pub const MAX_PREFIX_LEN: usize = MAX_NAME_LEN - 1 - 2 * TOKEN_BYTES;

/// Returns true if `c` may appear in a stack name.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Stable leading component of every child stack name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix(String);

impl Prefix {
    /// Validates a prefix: it must start with a letter, contain only ASCII alphanumerics
    /// or dashes, and be at most [MAX_PREFIX_LEN] characters.
    pub fn new(prefix: impl Into<String>) -> Result<Self, Error> {
        let prefix = prefix.into();
        let starts_with_letter = prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic());
        if !starts_with_letter
            || prefix.len() > MAX_PREFIX_LEN
            || !prefix.chars().all(is_name_char)
        {
            return Err(Error::InvalidPrefix(prefix));
        }
        Ok(Self(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Prefix {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Prefix> for String {
    fn from(value: Prefix) -> Self {
        value.0
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a child deployment stack.
///
/// Only produced by [derive] (or restored from a persisted record).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildStackName(String);

impl ChildStackName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `name` could have been produced by [derive].
    pub fn is_well_formed(name: &str) -> bool {
        !name.is_empty() && name.len() <= MAX_NAME_LEN && name.chars().all(is_name_char)
    }

    /// Parses a name supplied by an operator (e.g. on the command line).
    pub fn parse(name: &str) -> Option<Self> {
        Self::is_well_formed(name).then(|| Self(name.to_string()))
    }
}

impl AsRef<str> for ChildStackName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChildStackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the child stack name for `id` under `prefix`.
pub fn derive(prefix: &Prefix, id: &RequestId) -> ChildStackName {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(id.as_str().as_bytes());
    let digest = hasher.finalize();

    let mut name = String::with_capacity(prefix.as_str().len() + 1 + 2 * TOKEN_BYTES);
    name.push_str(prefix.as_str());
    name.push('-');
    name.push_str(&hex(&digest[..TOKEN_BYTES]));
    ChildStackName(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_prefix_validation() {
        assert!(Prefix::new("ec2-inst").is_ok());
        assert!(Prefix::new("a").is_ok());
        assert!(Prefix::new("a".repeat(MAX_PREFIX_LEN)).is_ok());

        assert!(matches!(Prefix::new(""), Err(Error::InvalidPrefix(_))));
        assert!(matches!(Prefix::new("1inst"), Err(Error::InvalidPrefix(_))));
        assert!(matches!(Prefix::new("-inst"), Err(Error::InvalidPrefix(_))));
        assert!(matches!(Prefix::new("ec2_inst"), Err(Error::InvalidPrefix(_))));
        assert!(matches!(Prefix::new("ec2 inst"), Err(Error::InvalidPrefix(_))));
        assert!(matches!(
            Prefix::new("a".repeat(MAX_PREFIX_LEN + 1)),
            Err(Error::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_derive_format() {
        let prefix = Prefix::new("ec2-inst").unwrap();
        let name = derive(&prefix, &RequestId::new("request-1"));
        let token = name.as_str().strip_prefix("ec2-inst-").unwrap();
        assert_eq!(token.len(), 2 * TOKEN_BYTES);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(ChildStackName::is_well_formed(name.as_str()));
        assert_eq!(ChildStackName::parse(name.as_str()), Some(name));
        assert_eq!(ChildStackName::parse("../etc"), None);
    }

    #[test]
    fn test_derive_longest_prefix_fits() {
        let prefix = Prefix::new("a".repeat(MAX_PREFIX_LEN)).unwrap();
        let name = derive(&prefix, &RequestId::random());
        assert_eq!(name.as_str().len(), MAX_NAME_LEN);
        assert!(ChildStackName::is_well_formed(name.as_str()));
    }

    #[test]
    fn test_derive_is_stable_for_same_request() {
        let prefix = Prefix::new("ec2-inst").unwrap();
        let id = RequestId::new("retry-me");
        assert_eq!(derive(&prefix, &id), derive(&prefix, &id));
    }

    #[test]
    fn test_derive_does_not_embed_request_id() {
        let prefix = Prefix::new("ec2-inst").unwrap();
        let name = derive(&prefix, &RequestId::new("deadbeef"));
        assert!(!name.as_str().contains("deadbeef"));
    }

    #[test]
    fn test_derive_distinguishes_prefix_boundary() {
        // ("ab", "c") and ("a", "bc") must not collide
        let a = derive(&Prefix::new("ab").unwrap(), &RequestId::new("c"));
        let b = derive(&Prefix::new("a").unwrap(), &RequestId::new("bc"));
        assert_ne!(
            a.as_str().rsplit('-').next(),
            b.as_str().rsplit('-').next()
        );
    }

    #[test]
    fn test_derive_unique_for_random_requests() {
        let prefix = Prefix::new("ec2-inst").unwrap();
        let names: HashSet<_> = (0..1_000)
            .map(|_| derive(&prefix, &RequestId::random()))
            .collect();
        assert_eq!(names.len(), 1_000);
    }
}

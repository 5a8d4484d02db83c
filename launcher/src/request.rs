//! Provisioning parameters and their validation.
//!
//! A [ProvisionRequest] is accepted as raw text and checked by [ProvisionRequest::validate]
//! before the orchestrator performs any side effect.

use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length (in bytes) of an EC2 key-pair name.
pub const MAX_KEY_PAIR_NAME_LEN: usize = 255;

/// Largest IPv4 prefix length.
const MAX_MASK: u8 = 32;

/// Reasons a [ProvisionRequest] is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed CIDR block: {0:?}")]
    Cidr(String),
    #[error("key pair name is empty")]
    EmptyKeyPairName,
    #[error("key pair name too long: {0} bytes")]
    KeyPairNameTooLong(usize),
    #[error("key pair name contains control characters")]
    KeyPairNameInvalid,
    #[error("request id is empty")]
    EmptyRequestId,
}

/// An IPv4 CIDR block: a dotted quad with an optional `/0`-`/32` mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    address: Ipv4Addr,
    mask: Option<u8>,
}

impl Cidr {
    /// Returns the network address.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Returns the prefix length, if one was given.
    pub fn mask(&self) -> Option<u8> {
        self.mask
    }
}

/// Parses a decimal field of at most `max_digits` ASCII digits.
fn parse_decimal(field: &str, max_digits: usize) -> Option<u16> {
    if field.is_empty() || field.len() > max_digits || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

impl FromStr for Cidr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::Cidr(s.to_string());
        let (address, mask) = match s.split_once('/') {
            Some((address, mask)) => (address, Some(mask)),
            None => (s, None),
        };

        // Exactly four octets of 1-3 digits, each at most 255
        let mut octets = [0u8; 4];
        let mut fields = address.split('.');
        for octet in octets.iter_mut() {
            let value = fields
                .next()
                .and_then(|field| parse_decimal(field, 3))
                .ok_or_else(invalid)?;
            *octet = u8::try_from(value).map_err(|_| invalid())?;
        }
        if fields.next().is_some() {
            return Err(invalid());
        }

        // Mask is 0-32 without leading zeros
        let mask = match mask {
            None => None,
            Some(mask) => {
                if mask.len() > 1 && mask.starts_with('0') {
                    return Err(invalid());
                }
                let value = parse_decimal(mask, 2).ok_or_else(invalid)?;
                if value > MAX_MASK as u16 {
                    return Err(invalid());
                }
                Some(value as u8)
            }
        };

        Ok(Self {
            address: Ipv4Addr::from(octets),
            mask,
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mask {
            Some(mask) => write!(f, "{}/{}", self.address, mask),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Identifies one logical provisioning request.
///
/// Retries of the same logical request must reuse the same id so that they resolve to
/// the same child stack name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh, random request id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps a caller-supplied request id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters of a single provisioning request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Idempotency key of the request.
    pub id: RequestId,
    /// CIDR block allowed to reach the instance over SSH.
    pub inbound_cidr: String,
    /// Name of the EC2 key pair installed on the instance.
    pub key_pair_name: String,
}

impl ProvisionRequest {
    /// Creates a request with a fresh [RequestId].
    pub fn new(inbound_cidr: impl Into<String>, key_pair_name: impl Into<String>) -> Self {
        Self {
            id: RequestId::random(),
            inbound_cidr: inbound_cidr.into(),
            key_pair_name: key_pair_name.into(),
        }
    }

    /// Replaces the request id (used when retrying a known request).
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    /// Checks the request and returns the parsed CIDR block.
    pub fn validate(&self) -> Result<Cidr, ValidationError> {
        if self.id.as_str().is_empty() {
            return Err(ValidationError::EmptyRequestId);
        }
        let cidr = self.inbound_cidr.parse::<Cidr>()?;
        if self.key_pair_name.trim().is_empty() {
            return Err(ValidationError::EmptyKeyPairName);
        }
        if self.key_pair_name.len() > MAX_KEY_PAIR_NAME_LEN {
            return Err(ValidationError::KeyPairNameTooLong(
                self.key_pair_name.len(),
            ));
        }
        if self.key_pair_name.chars().any(char::is_control) {
            return Err(ValidationError::KeyPairNameInvalid);
        }
        Ok(cidr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_accepts() {
        let cases = [
            ("203.0.113.0/24", "203.0.113.0/24", Some(24)),
            ("0.0.0.0/0", "0.0.0.0/0", Some(0)),
            ("255.255.255.255/32", "255.255.255.255/32", Some(32)),
            ("10.0.0.1", "10.0.0.1", None),
            ("192.168.1.0/9", "192.168.1.0/9", Some(9)),
            ("1.2.3.4/19", "1.2.3.4/19", Some(19)),
            ("001.002.003.004/30", "1.2.3.4/30", Some(30)),
        ];
        for (input, display, mask) in cases {
            let cidr: Cidr = input.parse().unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(cidr.to_string(), display);
            assert_eq!(cidr.mask(), mask);
        }
    }

    #[test]
    fn test_cidr_rejects() {
        let cases = [
            "",
            "1.2.3",
            "1.2.3.4.5",
            "1.2.3.4.",
            ".1.2.3.4",
            "256.1.1.1",
            "1.1.1.999",
            "999.1.1.1/33",
            "1.2.3.4/33",
            "1.2.3.4/100",
            "1.2.3.4/",
            "1.2.3.4/05",
            "1.2.3.4/-1",
            "1.2.3.4/24/8",
            "1.2.3.4 /24",
            "1.2.3.4/+8",
            "1234.1.1.1",
            "a.b.c.d",
            "1..2.3",
            "::1/128",
            "1.2.3.4/2a",
        ];
        for input in cases {
            assert_eq!(
                input.parse::<Cidr>(),
                Err(ValidationError::Cidr(input.to_string())),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_request() {
        let request = ProvisionRequest::new("203.0.113.0/24", "demo-key");
        let cidr = request.validate().unwrap();
        assert_eq!(cidr.address(), Ipv4Addr::new(203, 0, 113, 0));

        let request = ProvisionRequest::new("203.0.113.0/24", "  ");
        assert_eq!(request.validate(), Err(ValidationError::EmptyKeyPairName));

        let request = ProvisionRequest::new("203.0.113.0/24", "a".repeat(256));
        assert_eq!(
            request.validate(),
            Err(ValidationError::KeyPairNameTooLong(256))
        );

        let request = ProvisionRequest::new("203.0.113.0/24", "demo\nkey");
        assert_eq!(request.validate(), Err(ValidationError::KeyPairNameInvalid));

        let request = ProvisionRequest::new("203.0.113.0/24", "demo-key").with_id(RequestId::new(""));
        assert_eq!(request.validate(), Err(ValidationError::EmptyRequestId));
    }

    #[test]
    fn test_cidr_checked_before_key_pair() {
        let request = ProvisionRequest::new("999.1.1.1/33", "");
        assert_eq!(
            request.validate(),
            Err(ValidationError::Cidr("999.1.1.1/33".to_string()))
        );
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(RequestId::random(), RequestId::random());
    }
}

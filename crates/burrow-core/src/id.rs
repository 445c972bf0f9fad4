//! Subdomain client ids

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::error::Error;

/// Length of generated ids.
pub const GENERATED_ID_LEN: usize = 8;

const MIN_LEN: usize = 4;
const MAX_LEN: usize = 63;
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A validated tunnel client id.
///
/// The id doubles as the leftmost DNS label of the tunnel's public
/// hostname, which is where the charset and length limits come from:
/// lowercase alphanumeric, 4 to 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Validate `id` as a client id.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if Self::is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(Error::InvalidClientId { id })
        }
    }

    /// Check the id format without constructing one.
    pub fn is_valid(s: &str) -> bool {
        (MIN_LEN..=MAX_LEN).contains(&s.len())
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    }

    /// Generate a uniformly random id of [`GENERATED_ID_LEN`] characters.
    /// Uniqueness is the registry's problem; collisions there retry.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..GENERATED_ID_LEN)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(ClientId::new("abcd").is_ok());
        assert!(ClientId::new("a1b2c3").is_ok());
        assert!(ClientId::new("0000").is_ok());
        assert!(ClientId::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert!(ClientId::new("abc").is_err()); // too short
        assert!(ClientId::new("a".repeat(64)).is_err()); // too long
        assert!(ClientId::new("ABCD").is_err()); // uppercase
        assert!(ClientId::new("ab-cd").is_err()); // punctuation
        assert!(ClientId::new("ab cd").is_err()); // whitespace
        assert!(ClientId::new("").is_err());
    }

    #[test]
    fn test_generate_is_valid() {
        for _ in 0..100 {
            let id = ClientId::generate();
            assert!(ClientId::is_valid(id.as_str()));
            assert_eq!(id.as_str().len(), GENERATED_ID_LEN);
        }
    }
}

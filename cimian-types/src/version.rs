use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single dot-separated component of a [`Version`].
///
/// Numeric tokens compare numerically; everything else compares
/// lexicographically. A missing token sorts less than any present token,
/// which is handled at the `Version` level rather than here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Numeric(u64),
    Text(String),
}

impl Token {
    fn parse(s: &str) -> Token {
        match s.parse::<u64>() {
            Ok(n) => Token::Numeric(n),
            Err(_) => Token::Text(s.to_string()),
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Token::Numeric(a), Token::Numeric(b)) => a.cmp(b),
            (Token::Text(a), Token::Text(b)) => a.cmp(b),
            // A numeric token is considered greater than a textual one at the
            // same position; this only matters for mixed-format catalogs and
            // keeps ordering total rather than panicking.
            (Token::Numeric(_), Token::Text(_)) => Ordering::Greater,
            (Token::Text(_), Token::Numeric(_)) => Ordering::Less,
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Token::Numeric(n) => write!(f, "{}", n),
            Token::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Dotted-numeric version with optional trailing text per component, e.g.
/// `2025.08.31.2030` or `1.4.0-beta2`.
#[derive(Debug, Clone, Eq, Hash)]
pub struct Version {
    raw: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum VersionParseError {
    #[error("version string is empty")]
    Empty,
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(VersionParseError::Empty);
        }

        let tokens = s.split('.').map(Token::parse).collect();
        Ok(Version {
            raw: s.to_string(),
            tokens,
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.tokens.len().max(other.tokens.len());

        for i in 0..len {
            let ord = match (self.tokens.get(i), other.tokens.get(i)) {
                (Some(a), Some(b)) => a.cmp(b),
                // Missing tokens sort less than present ones.
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };

            if ord != Ordering::Equal {
                return ord;
            }
        }

        Ordering::Equal
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Version {
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_versions() {
        let a = Version::from_str("1.2.3").unwrap();
        let b = Version::from_str("1.2.3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lesser_version() {
        let a = Version::from_str("0.1.2").unwrap();
        let b = Version::from_str("34.1.0").unwrap();
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_trailing_token_sorts_less() {
        let a = Version::from_str("1.2").unwrap();
        let b = Version::from_str("1.2.1").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_missing_trailing_token_sorts_less_even_when_zero() {
        let a = Version::from_str("1.2").unwrap();
        let b = Version::from_str("1.2.0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_trailing_text_component() {
        let a = Version::from_str("1.4.0-beta2").unwrap();
        let b = Version::from_str("1.4.0-beta10").unwrap();
        // Lexicographic comparison of the non-numeric final component.
        assert!(a > b);
    }

    #[test]
    fn test_timestamp_style_version() {
        let a = Version::from_str("2025.08.01.0900").unwrap();
        let b = Version::from_str("2025.08.31.2030").unwrap();
        assert!(a < b);
    }
}

//! PostgreSQL log sequence numbers, used as replication positions.
//!
//! The textual form is two hexadecimal halves separated by a slash
//! (`16/B374D848`); the numeric form is `(hi << 32) | lo`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A position in the write-ahead log. Ordered; larger is more advanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid LSN {0:?}")]
pub struct LsnParseError(String);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl TryFrom<String> for Lsn {
    type Error = LsnParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn test_ordering_across_high_word() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("B374D848".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
        assert!("".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let lsn: Lsn = serde_json::from_str("\"0/3000060\"").unwrap();
        assert_eq!(lsn, Lsn(0x0300_0060));
        assert_eq!(serde_json::to_string(&lsn).unwrap(), "\"0/3000060\"");
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CaravelError, Result};

/// Compression applied to a bucket payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketCompression {
    None,
    Gzip,
}

impl BucketCompression {
    /// Parse from a wire/config string, `"none"` or `"gzip"`.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(BucketCompression::None),
            "gzip" => Ok(BucketCompression::Gzip),
            other => Err(CaravelError::ParameterOutOfRange(format!(
                "valid compression methods are \"gzip\" and \"none\", but found: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketCompression::None => "none",
            BucketCompression::Gzip => "gzip",
        }
    }
}

impl fmt::Display for BucketCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        for c in [BucketCompression::None, BucketCompression::Gzip] {
            assert_eq!(BucketCompression::parse(c.as_str()).unwrap(), c);
        }
    }

    #[test]
    fn parsing_is_case_sensitive() {
        assert!(BucketCompression::parse("None").is_err());
        assert!(BucketCompression::parse("GZIP").is_err());
    }

    #[test]
    fn serde_uses_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&BucketCompression::Gzip).unwrap(),
            r#""gzip""#
        );
        let parsed: BucketCompression = serde_json::from_str(r#""none""#).unwrap();
        assert_eq!(parsed, BucketCompression::None);
    }
}

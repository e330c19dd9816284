//! Serde helpers for the JSON wire format.
//!
//! Sizes and offsets may exceed 32 bits, so the protocol encodes them as
//! decimal strings. Readers must parse the string and fail with a
//! deserialisation error (surfaced as *bad file format*) on anything
//! non-numeric.

/// `u64` encoded as a decimal string, e.g. `"Size": "4096"`.
pub mod u64_string {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse::<u64>()
            .map_err(|_| D::Error::custom(format!("expected a decimal string, got '{text}'")))
    }
}

// SPDX-License-Identifier: GPL-2.0-only

//! Entity identifiers.
//!
//! Every Keel entity is keyed by a random positive 64-bit integer.
//! - Storage: INTEGER column
//! - Logs, bus payloads, device names: 13-char lowercase base32

use data_encoding::BASE32_NOPAD;
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(i64);

impl Id {
    /// Random id with 63 bits of entropy (always positive).
    pub fn generate() -> Self {
        Id((rand::random::<u64>() >> 1) as i64)
    }

    pub fn from_i64(value: i64) -> Self {
        Id(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Base32 form, lowercase, 13 chars. Short enough to embed in a
    /// network interface name.
    pub fn encode(&self) -> String {
        BASE32_NOPAD.encode(&self.0.to_be_bytes()).to_lowercase()
    }

    pub fn decode(s: &str) -> Result<Self, IdError> {
        let bytes = BASE32_NOPAD
            .decode(s.to_uppercase().as_bytes())
            .map_err(|_| IdError::InvalidEncoding)?;
        let arr: [u8; 8] = bytes.try_into().map_err(|_| IdError::InvalidLength)?;
        Ok(Id(i64::from_be_bytes(arr)))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::decode(s)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Id::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Id {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Id {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid base32 encoding")]
    InvalidEncoding,
    #[error("invalid ID length (expected 8 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_positive_and_distinct() {
        let a = Id::generate();
        let b = Id::generate();
        assert_ne!(a, b);
        assert!(a.as_i64() >= 0);
    }

    #[test]
    fn encoded_form_fits_interface_names() {
        let id = Id::from_i64(i64::MAX);
        let encoded = id.encode();
        assert_eq!(encoded.len(), 13);
        // "k" prefix + id must stay under IFNAMSIZ (16 incl. NUL)
        assert!(format!("k{encoded}").len() < 16);
        assert_eq!(Id::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn decode_is_case_insensitive() {
        let id = Id::from_i64(12345);
        let upper = id.encode().to_uppercase();
        assert_eq!(Id::decode(&upper).unwrap(), id);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(matches!(Id::decode("invalid!@#"), Err(IdError::InvalidEncoding)));
        let short = BASE32_NOPAD.encode(&[1, 2, 3, 4]).to_lowercase();
        assert!(matches!(Id::decode(&short), Err(IdError::InvalidLength)));
    }

    #[test]
    fn serde_uses_base32_string() {
        let id = Id::from_i64(999999);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.encode()));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn sql_roundtrip_as_integer() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let id = Id::from_i64(42);
        let raw: i64 = conn.query_row("SELECT ?1", [id], |row| row.get(0)).unwrap();
        assert_eq!(raw, 42);
        let back: Id = conn.query_row("SELECT 42", [], |row| row.get(0)).unwrap();
        assert_eq!(back, id);
    }
}

//! DocumentId and DocType: the two identifier newtypes shared by every
//! component in this crate.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use ulid::Ulid;

/// Opaque lowercase ULID string uniquely identifying a document across all
/// users and devices.
///
/// Wraps [`ulid::Ulid`], which renders as uppercase Crockford base32; this
/// type lowercases on [`Display`] and uppercases before delegating to
/// [`Ulid::from_string`], so the wire/storage representation is always
/// lowercase as the spec requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Ulid);

impl DocumentId {
    /// Generate a new, time-sortable document id.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_ascii_lowercase())
    }
}

impl FromStr for DocumentId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(&s.to_ascii_uppercase()).map(Self)
    }
}

impl serde::Serialize for DocumentId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DocumentId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Short identifier naming a schema registered in a [`crate::binding::DocBinding`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct DocType(String);

impl DocType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Per-document monotonic counter held by both server and client.
///
/// Strictly monotonic on the server; a client's stored clock reflects the
/// server's clock as of its last successful push-consolidation.
pub type Clock = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_round_trips_lowercase() {
        let id = DocumentId::generate();
        let s = id.to_string();
        assert_eq!(s, s.to_ascii_lowercase());
        let parsed: DocumentId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn document_id_rejects_garbage() {
        assert!("not-a-ulid".parse::<DocumentId>().is_err());
    }

    #[test]
    fn doc_type_equality_is_case_sensitive() {
        assert_ne!(DocType::new("indexDoc"), DocType::new("IndexDoc"));
    }

    #[test]
    fn doc_type_serializes_as_plain_string() {
        let t = DocType::new("indexDoc");
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"indexDoc\"");
    }
}

//! Structured resource names.
//!
//! Every record is addressed by a URN of the fixed shape
//! `urn:themis:{model}:{namespace}:{collection}:{uuid}`. Placement only looks
//! at the uuid, so the same record hashes identically however it is spelled
//! elsewhere in the name.

use crate::error::UrnError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;
use twox_hash::XxHash64;

const PREFIX: &str = "urn";
const NAMESPACE_ID: &str = "themis";

/// Data model a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Relational,
    Graph,
    Vector,
    Timeseries,
    Document,
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Relational => "relational",
            Model::Graph => "graph",
            Model::Vector => "vector",
            Model::Timeseries => "timeseries",
            Model::Document => "document",
        }
    }
}

impl FromStr for Model {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relational" => Ok(Model::Relational),
            "graph" => Ok(Model::Graph),
            "vector" => Ok(Model::Vector),
            "timeseries" => Ok(Model::Timeseries),
            "document" => Ok(Model::Document),
            other => Err(UrnError::InvalidModel(other.to_string())),
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed resource name. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Urn {
    model: Model,
    namespace: String,
    collection: String,
    uuid: String,
}

impl Urn {
    /// Build a URN from its components, validating each of them.
    pub fn new(
        model: Model,
        namespace: impl Into<String>,
        collection: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Result<Self, UrnError> {
        let namespace = namespace.into();
        let collection = collection.into();
        let uuid = uuid.into();

        validate_component("namespace", &namespace)?;
        validate_component("collection", &collection)?;
        if !is_valid_uuid(&uuid) {
            return Err(UrnError::InvalidUuid(uuid));
        }

        Ok(Self {
            model,
            namespace,
            collection,
            uuid,
        })
    }

    /// Parse a URN string.
    pub fn parse(s: &str) -> Result<Self, UrnError> {
        let tokens: Vec<&str> = s.split(':').collect();
        if tokens.len() != 6 {
            return Err(UrnError::WrongTokenCount(tokens.len()));
        }
        if tokens[0] != PREFIX || tokens[1] != NAMESPACE_ID {
            return Err(UrnError::BadPrefix);
        }
        let model = tokens[2].parse()?;
        Self::new(model, tokens[3], tokens[4], tokens[5])
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Placement hash. Depends on the uuid only, compared case-insensitively.
    pub fn hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(self.uuid.to_ascii_lowercase().as_bytes());
        hasher.finish()
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            PREFIX, NAMESPACE_ID, self.model, self.namespace, self.collection, self.uuid
        )
    }
}

impl FromStr for Urn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Urn::parse(s)
    }
}

impl Serialize for Urn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Urn::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn validate_component(name: &'static str, value: &str) -> Result<(), UrnError> {
    if value.is_empty() {
        return Err(UrnError::EmptyComponent(name));
    }
    Ok(())
}

/// 8-4-4-4-12 hex digits, any case.
fn is_valid_uuid(s: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

    let parts: Vec<&str> = s.split('-').collect();
    parts.len() == GROUPS.len()
        && parts
            .iter()
            .zip(GROUPS)
            .all(|(part, len)| part.len() == len && part.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn test_parse_and_display_round_trip() {
        let s = format!("urn:themis:document:tenant_a:orders:{}", UUID);
        let urn = Urn::parse(&s).unwrap();

        assert_eq!(urn.model(), Model::Document);
        assert_eq!(urn.namespace(), "tenant_a");
        assert_eq!(urn.collection(), "orders");
        assert_eq!(urn.uuid(), UUID);
        assert_eq!(urn.to_string(), s);
        assert_eq!(Urn::parse(&urn.to_string()).unwrap(), urn);
    }

    #[test]
    fn test_every_model_parses() {
        for model in ["relational", "graph", "vector", "timeseries", "document"] {
            let s = format!("urn:themis:{}:ns:c:{}", model, UUID);
            let urn = Urn::parse(&s).unwrap();
            assert_eq!(urn.model().as_str(), model);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            Urn::parse("urn:themis:bogus:ns:coll:not-a-uuid"),
            Err(UrnError::InvalidModel(_))
        ));
        assert!(matches!(
            Urn::parse(&format!("urn:themis:graph:ns:{}", UUID)),
            Err(UrnError::WrongTokenCount(5))
        ));
        assert!(matches!(
            Urn::parse(&format!("urn:themis:graph:ns:c:{}:extra", UUID)),
            Err(UrnError::WrongTokenCount(7))
        ));
        assert!(matches!(
            Urn::parse(&format!("urn:other:graph:ns:c:{}", UUID)),
            Err(UrnError::BadPrefix)
        ));
        assert!(matches!(
            Urn::parse("urn:themis:graph:ns:c:550e8400-e29b-41d4-a716-44665544000"),
            Err(UrnError::InvalidUuid(_))
        ));
        assert!(matches!(
            Urn::parse("urn:themis:graph:ns:c:550e8400-e29b-41d4-a716-44665544000g"),
            Err(UrnError::InvalidUuid(_))
        ));
        assert!(matches!(
            Urn::parse(&format!("urn:themis:graph::c:{}", UUID)),
            Err(UrnError::EmptyComponent("namespace"))
        ));
    }

    #[test]
    fn test_uuid_is_case_insensitive() {
        let upper = UUID.to_ascii_uppercase();
        let s = format!("urn:themis:vector:ns:emb:{}", upper);
        let urn = Urn::parse(&s).unwrap();
        assert_eq!(urn.to_string(), s);

        let lower = Urn::parse(&format!("urn:themis:vector:ns:emb:{}", UUID)).unwrap();
        assert_eq!(urn.hash(), lower.hash());
    }

    #[test]
    fn test_hash_depends_on_uuid_only() {
        let a = Urn::new(Model::Graph, "ns1", "nodes", UUID).unwrap();
        let b = Urn::new(Model::Relational, "ns2", "rows", UUID).unwrap();
        assert_eq!(a.hash(), b.hash());

        let c = Urn::new(Model::Graph, "ns1", "nodes", "650e8400-e29b-41d4-a716-446655440000")
            .unwrap();
        assert_ne!(a.hash(), c.hash());

        // Repeated parses are stable.
        assert_eq!(a.hash(), Urn::parse(&a.to_string()).unwrap().hash());
    }

    #[test]
    fn test_serde_as_string() {
        let urn = Urn::new(Model::Timeseries, "metrics", "cpu", UUID).unwrap();
        let json = serde_json::to_string(&urn).unwrap();
        assert_eq!(json, format!("\"{}\"", urn));

        let back: Urn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, urn);
        assert!(serde_json::from_str::<Urn>("\"urn:themis:x\"").is_err());
    }
}

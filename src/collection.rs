//! The named, schema-free collections held by the store.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// A collection maps arbitrary string keys to arbitrary JSON values.
/// The only structural rule enforced is that the top-level value is an object.
pub type Collection = Map<String, Value>;

/// The closed set of collections the store persists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionName {
    /// registered clients
    Users,
    /// per client, per course predictions
    Guesses,
    /// actual averages posted by the operator
    Results,
}

impl CollectionName {
    /// every collection, in the order they appear in a snapshot
    pub const ALL: [CollectionName; 3] = [
        CollectionName::Users,
        CollectionName::Guesses,
        CollectionName::Results,
    ];

    /// the name used on disk and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Users => "users",
            CollectionName::Guesses => "guesses",
            CollectionName::Results => "results",
        }
    }

    /// the file name holding this collection within the data directory
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionName {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "users" => Ok(CollectionName::Users),
            "guesses" => Ok(CollectionName::Guesses),
            "results" | "actual_results" => Ok(CollectionName::Results),
            other => Err(StoreError::Parsing(format!("unknown collection: {}", other))),
        }
    }
}

/// Merges `delta` into `base`, key by key, at the top level only.
///
/// A key present in `delta` replaces the whole value stored under that key in `base`, nested
/// objects included. Sibling fields nested under a replaced key are NOT preserved.
pub fn merge(base: &mut Collection, delta: Collection) {
    for (key, value) in delta {
        base.insert(key, value);
    }
}

/// Converts an arbitrary JSON value into a [`Collection`], failing if it is not an object.
pub fn into_collection(value: Value) -> Result<Collection> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::NotAnObject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Collection {
        into_collection(v).unwrap()
    }

    #[test]
    fn merge_is_last_write_wins_per_top_level_key() {
        let mut users = obj(json!({"alice": {"email": "a@x.com", "name": "Alice"}, "bob": {}}));
        merge(&mut users, obj(json!({"alice": {"email": "b@x.com"}})));

        assert_eq!(users["alice"]["email"], "b@x.com");
        // the nested sibling is dropped along with the old value
        assert!(users["alice"].get("name").is_none());
        assert!(users.contains_key("bob"));
    }

    #[test]
    fn only_objects_become_collections() {
        assert!(into_collection(json!([1, 2])).is_err());
        assert!(into_collection(json!("users")).is_err());
        assert!(into_collection(json!({})).unwrap().is_empty());
    }

    #[test]
    fn names_round_trip_through_strings() {
        for name in CollectionName::ALL.iter() {
            assert_eq!(name.as_str().parse::<CollectionName>().unwrap(), *name);
        }
        assert_eq!("actual_results".parse::<CollectionName>().unwrap(), CollectionName::Results);
        assert!("orders".parse::<CollectionName>().is_err());
    }
}

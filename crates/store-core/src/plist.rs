//! The property-list value model that every `LogEntry` blob decodes to.

use std::collections::BTreeMap;

/// A property-list value: scalars, byte strings, ordered sequences, and
/// string-keyed mappings (spec §3, §6). `BTreeMap` keeps dictionary encoding
/// deterministic, which the canonical codec (§4.3) requires for two peers to
/// agree byte-for-byte.
///
/// `Serialize`/`Deserialize` are derived for debug and test tooling only —
/// the on-the-wire format two peers actually exchange is the binary codec
/// in [`crate::codec`], not JSON.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PList {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<PList>),
    Dict(BTreeMap<String, PList>),
}

impl PList {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PList::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PList::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, PList>> {
        match self {
            PList::Dict(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for PList {
    fn from(value: &str) -> Self {
        PList::String(value.to_string())
    }
}

impl From<String> for PList {
    fn from(value: String) -> Self {
        PList::String(value)
    }
}

impl From<i64> for PList {
    fn from(value: i64) -> Self {
        PList::Int(value)
    }
}

impl From<bool> for PList {
    fn from(value: bool) -> Self {
        PList::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_nested_dict_through_json() {
        let mut dict = BTreeMap::new();
        dict.insert("name".to_string(), PList::from("device-a"));
        dict.insert("retries".to_string(), PList::from(3i64));
        dict.insert("armed".to_string(), PList::from(true));
        dict.insert(
            "tags".to_string(),
            PList::Array(vec![PList::from("a"), PList::Null]),
        );
        let value = PList::Dict(dict);

        let json = serde_json::to_string(&value).expect("serialize");
        let back: PList = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(value, back);
    }
}

//! Live reference bookkeeping for a single block.
//!
//! Each counted reference is keyed by its [`RefNonce`]. Inserting the same
//! nonce twice counts once; the block may be reclaimed once the table is
//! empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::block::{RefNonce, TlfId, UserId};

/// Who holds a reference and where it is accounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    /// Creator named by the context that added the reference.
    pub creator: UserId,
    /// Account charged for the reference.
    pub writer: UserId,
    /// Folder the reference belongs to.
    pub tlf: TlfId,
}

/// Serialized form of one reference; the nonce is hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefRecord {
    /// Hex nonce.
    pub nonce: String,
    /// The reference.
    #[serde(flatten)]
    pub entry: RefEntry,
}

/// Live references of one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RefRecord>", into = "Vec<RefRecord>")]
pub struct RefTable {
    refs: BTreeMap<RefNonce, RefEntry>,
}

impl RefTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. Returns false if `nonce` was already live.
    pub fn insert(&mut self, nonce: RefNonce, entry: RefEntry) -> bool {
        if self.refs.contains_key(&nonce) {
            return false;
        }
        self.refs.insert(nonce, entry);
        true
    }

    /// Drop a reference, returning it if it was live.
    pub fn remove(&mut self, nonce: &RefNonce) -> Option<RefEntry> {
        self.refs.remove(nonce)
    }

    /// True if `nonce` is live.
    pub fn contains(&self, nonce: &RefNonce) -> bool {
        self.refs.contains_key(nonce)
    }

    /// Number of live references.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// True when no references remain.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Iterate over live references in nonce order.
    pub fn iter(&self) -> impl Iterator<Item = (&RefNonce, &RefEntry)> {
        self.refs.iter()
    }
}

impl From<RefTable> for Vec<RefRecord> {
    fn from(table: RefTable) -> Self {
        table
            .refs
            .into_iter()
            .map(|(nonce, entry)| RefRecord {
                nonce: nonce.to_hex(),
                entry,
            })
            .collect()
    }
}

impl TryFrom<Vec<RefRecord>> for RefTable {
    type Error = String;

    fn try_from(stored: Vec<RefRecord>) -> Result<Self, Self::Error> {
        let mut refs = BTreeMap::new();
        for s in stored {
            let bytes = hex::decode(&s.nonce).map_err(|e| format!("ref nonce {}: {}", s.nonce, e))?;
            let nonce: [u8; 8] = bytes
                .try_into()
                .map_err(|_| format!("ref nonce {}: expected 8 bytes", s.nonce))?;
            refs.insert(RefNonce(nonce), s.entry);
        }
        Ok(Self { refs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(writer: &str) -> RefEntry {
        RefEntry {
            creator: "alice".into(),
            writer: writer.into(),
            tlf: TlfId::new("tlf"),
        }
    }

    #[test]
    fn test_insert_same_nonce_counts_once() {
        let mut table = RefTable::new();
        let n = RefNonce([1; 8]);
        assert!(table.insert(n, entry("alice")));
        assert!(!table.insert(n, entry("bob")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(&n).map(|e| e.writer), Some("alice".to_string()));
    }

    #[test]
    fn test_remove_missing_is_none() {
        let mut table = RefTable::new();
        assert!(table.remove(&RefNonce([9; 8])).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_json_form_uses_hex_nonces() {
        let mut table = RefTable::new();
        table.insert(RefNonce([0xab; 8]), entry("alice"));
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.contains("abababababababab"));
        let back: RefTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_json_bad_nonce_rejected() {
        let json = r#"[{"nonce":"xyz","creator":"a","writer":"a","tlf":"t"}]"#;
        assert!(serde_json::from_str::<RefTable>(json).is_err());
    }
}

//! Relevant-keys projection (spec §9): bounds which keys a store materializes.

use std::collections::HashSet;

use crate::ids::Key;

/// Which keys a store loads from the union of device logs.
///
/// Defaults to `All`, matching spec §4.7.1 step 3's unconditional full scan.
/// `Only` lets a scan stop early once every requested key has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeySet {
    #[default]
    All,
    Only(HashSet<Key>),
}

impl KeySet {
    pub fn wants(&self, key: &str) -> bool {
        match self {
            KeySet::All => true,
            KeySet::Only(keys) => keys.contains(key),
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, KeySet::Only(_))
    }
}

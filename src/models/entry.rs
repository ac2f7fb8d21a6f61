//! Listing records returned by the object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single key in a bucket listing, with the store's modification time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

impl BucketEntry {
    pub fn new(key: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            last_modified,
        }
    }

    /// Canonical ordering: newest first, ties broken by key.
    pub fn newest_first(a: &BucketEntry, b: &BucketEntry) -> Ordering {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    }
}

/// Sort entries newest first.
pub fn sort_newest_first(entries: &mut [BucketEntry]) {
    entries.sort_by(BucketEntry::newest_first);
}

/// Size and timestamps of a stored object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sorts_newest_first_with_key_tiebreak() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut entries = vec![
            BucketEntry::new("b", t0),
            BucketEntry::new("c", t1),
            BucketEntry::new("a", t0),
        ];
        sort_newest_first(&mut entries);
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }
}

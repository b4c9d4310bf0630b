//! In-memory collection per resource.

use crew_core::SyncRecord;
use std::collections::{HashMap, HashSet};

/// Ordered, id-keyed set of records. Every mutation reports whether the
/// visible contents actually changed; `revision` moves only when they did.
#[derive(Debug, Clone)]
pub struct CollectionStore<T> {
    entries: Vec<T>,
    index: HashMap<String, usize>,
    revision: u64,
}

impl<T> Default for CollectionStore<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            revision: 0,
        }
    }
}

impl<T: SyncRecord> CollectionStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|idx| &self.entries[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Current contents in insertion order.
    pub fn read(&self) -> Vec<T> {
        self.entries.clone()
    }

    pub fn apply_upsert(&mut self, record: T) -> bool {
        let id = record.record_id().into_owned();
        match self.index.get(&id).copied() {
            Some(idx) if self.entries[idx] == record => false,
            Some(idx) => {
                self.entries[idx] = record;
                self.bump();
                true
            }
            None => {
                self.index.insert(id, self.entries.len());
                self.entries.push(record);
                self.bump();
                true
            }
        }
    }

    pub fn apply_delete(&mut self, id: &str) -> bool {
        let Some(idx) = self.index.remove(id) else {
            return false;
        };
        self.entries.remove(idx);
        self.reindex_from(idx);
        self.bump();
        true
    }

    /// Replace the whole collection. Kept ids keep their position, new ids are
    /// appended in snapshot order, ids missing from the snapshot are dropped.
    /// Within one snapshot the last row for an id wins.
    pub fn apply_snapshot(&mut self, records: Vec<T>) -> bool {
        let mut incoming: HashMap<String, T> = HashMap::with_capacity(records.len());
        let mut arrival: Vec<String> = Vec::with_capacity(records.len());
        for record in records {
            let id = record.record_id().into_owned();
            if incoming.insert(id.clone(), record).is_none() {
                arrival.push(id);
            }
        }

        let mut changed = false;
        let mut next: Vec<T> = Vec::with_capacity(arrival.len());
        let mut placed: HashSet<String> = HashSet::with_capacity(arrival.len());
        for existing in &self.entries {
            let id = existing.record_id();
            match incoming.remove(id.as_ref()) {
                Some(replacement) => {
                    if replacement != *existing {
                        changed = true;
                    }
                    placed.insert(id.into_owned());
                    next.push(replacement);
                }
                None => changed = true,
            }
        }
        for id in arrival {
            if placed.contains(&id) {
                continue;
            }
            if let Some(record) = incoming.remove(&id) {
                changed = true;
                next.push(record);
            }
        }

        if !changed {
            return false;
        }
        self.entries = next;
        self.reindex_from(0);
        self.bump();
        true
    }

    fn reindex_from(&mut self, start: usize) {
        if start == 0 {
            self.index.clear();
        }
        for (idx, entry) in self.entries.iter().enumerate().skip(start) {
            self.index.insert(entry.record_id().into_owned(), idx);
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_core::{parse_record, ChannelRecord, MessageRecord};
    use serde_json::json;

    fn message(id: &str, channel: &str, content: &str) -> MessageRecord {
        parse_record(json!({
            "id": id,
            "channelId": channel,
            "sender": "agent-a",
            "content": content
        }))
        .expect("message")
    }

    fn channel(id: &str, name: &str) -> ChannelRecord {
        parse_record(json!({ "id": id, "name": name })).expect("channel")
    }

    fn ids<T: SyncRecord>(store: &CollectionStore<T>) -> Vec<String> {
        store.iter().map(|r| r.record_id().into_owned()).collect()
    }

    #[test]
    fn last_upsert_for_an_id_wins() {
        let mut store = CollectionStore::new();
        for round in 0..5 {
            store.apply_upsert(message("m1", "c1", &format!("draft {round}")));
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("m1").map(|m| m.content.as_str()), Some("draft 4"));
    }

    #[test]
    fn identical_upsert_does_not_notify() {
        let mut store = CollectionStore::new();
        assert!(store.apply_upsert(channel("c1", "general")));
        let revision = store.revision();
        assert!(!store.apply_upsert(channel("c1", "general")));
        assert_eq!(store.revision(), revision);
        assert!(store.apply_upsert(channel("c1", "renamed")));
        assert_eq!(store.revision(), revision + 1);
    }

    #[test]
    fn delete_of_missing_id_is_a_silent_noop() {
        let mut store = CollectionStore::new();
        store.apply_upsert(channel("c1", "general"));
        let revision = store.revision();
        assert!(!store.apply_delete("nope"));
        assert_eq!(store.revision(), revision);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_keeps_remaining_order_and_index() {
        let mut store = CollectionStore::new();
        for id in ["m1", "m2", "m3", "m4"] {
            store.apply_upsert(message(id, "c1", id));
        }
        assert!(store.apply_delete("m2"));
        assert_eq!(ids(&store), vec!["m1", "m3", "m4"]);
        assert_eq!(store.get("m4").map(|m| m.content.as_str()), Some("m4"));
        assert!(store.apply_upsert(message("m3", "c1", "edited")));
        assert_eq!(ids(&store), vec!["m1", "m3", "m4"]);
    }

    #[test]
    fn empty_snapshot_clears_with_one_notification() {
        let mut store = CollectionStore::new();
        for id in ["c1", "c2", "c3"] {
            store.apply_upsert(channel(id, id));
        }
        let revision = store.revision();
        assert!(store.apply_snapshot(Vec::new()));
        assert!(store.is_empty());
        assert_eq!(store.revision(), revision + 1);
        assert!(!store.apply_snapshot(Vec::new()));
        assert_eq!(store.revision(), revision + 1);
    }

    #[test]
    fn unchanged_snapshot_does_not_notify() {
        let mut store = CollectionStore::new();
        store.apply_snapshot(vec![channel("c1", "a"), channel("c2", "b")]);
        let revision = store.revision();
        assert!(!store.apply_snapshot(vec![channel("c2", "b"), channel("c1", "a")]));
        assert_eq!(store.revision(), revision);
        assert_eq!(ids(&store), vec!["c1", "c2"]);
    }

    #[test]
    fn snapshot_reconciles_against_current_state() {
        let mut store = CollectionStore::new();
        for id in ["m1", "m2", "m3"] {
            store.apply_upsert(message(id, "c1", id));
        }
        let changed = store.apply_snapshot(vec![
            message("m4", "c1", "new"),
            message("m3", "c1", "m3"),
            message("m1", "c1", "edited"),
            message("m4", "c1", "newer"),
        ]);
        assert!(changed);
        assert_eq!(ids(&store), vec!["m1", "m3", "m4"]);
        assert_eq!(store.get("m1").map(|m| m.content.as_str()), Some("edited"));
        assert_eq!(store.get("m4").map(|m| m.content.as_str()), Some("newer"));
        assert!(store.get("m2").is_none());
    }

    #[test]
    fn dangling_channel_reference_is_stored() {
        let mut store = CollectionStore::new();
        assert!(store.apply_upsert(message("m1", "c9", "hello from nowhere")));
        assert_eq!(store.get("m1").map(|m| m.channel_id.as_str()), Some("c9"));
    }
}

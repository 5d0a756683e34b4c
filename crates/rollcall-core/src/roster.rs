//! Enrolled-roster store.
//!
//! In memory the roster is an insertion-ordered list of entries keyed by
//! student id. On disk it is a single JSON record of three parallel
//! sequences (ids, names, descriptors) rewritten wholesale on every
//! mutation; last writer wins on the whole file.

use crate::types::{Descriptor, RosterEntry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("roster io: {0}")]
    Io(#[from] std::io::Error),
    #[error("roster file corrupt: {0}")]
    Corrupt(String),
    #[error("descriptor dimension {actual} conflicts with roster dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// On-disk layout: parallel sequences of equal length.
#[derive(Serialize, Deserialize)]
struct RosterFile {
    ids: Vec<String>,
    names: Vec<String>,
    descriptors: Vec<Vec<f32>>,
}

pub struct RosterStore {
    path: Option<PathBuf>,
    entries: Vec<RosterEntry>,
}

impl RosterStore {
    /// Open the roster at `path`. An absent file yields an empty roster.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no roster file, starting empty");
            return Ok(Self { path: Some(path), entries: Vec::new() });
        }

        let raw = fs::read_to_string(&path)?;
        let file: RosterFile = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt(format!("parse: {e}")))?;

        if file.ids.len() != file.names.len() || file.ids.len() != file.descriptors.len() {
            return Err(StoreError::Corrupt(format!(
                "parallel sequence lengths differ: {} ids, {} names, {} descriptors",
                file.ids.len(),
                file.names.len(),
                file.descriptors.len()
            )));
        }
        if let Some(first) = file.descriptors.first() {
            if file.descriptors.iter().any(|d| d.len() != first.len()) {
                return Err(StoreError::Corrupt("mixed descriptor dimensions".into()));
            }
        }

        let entries = file
            .ids
            .into_iter()
            .zip(file.names)
            .zip(file.descriptors)
            .map(|((student_id, name), values)| RosterEntry {
                student_id,
                name,
                descriptor: Descriptor::new(values),
            })
            .collect::<Vec<_>>();

        tracing::info!(path = %path.display(), count = entries.len(), "loaded roster");
        Ok(Self { path: Some(path), entries })
    }

    /// A roster with no backing file; `persist` is a no-op. Used by tests
    /// and simulation mode.
    pub fn in_memory() -> Self {
        Self { path: None, entries: Vec::new() }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.entries.iter().any(|e| e.student_id == student_id)
    }

    /// Descriptor dimension shared by all entries, if any are enrolled.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.descriptor.dimension())
    }

    /// Insert or replace the entry for `student_id`, then persist.
    ///
    /// Replacement keeps the entry's position so matching tie-breaks stay
    /// stable. A descriptor whose dimension differs from the enrolled ones
    /// is rejected before any mutation. A persist failure is reported but
    /// the in-memory mutation stands; memory is authoritative until the
    /// next successful write.
    pub fn upsert(
        &mut self,
        student_id: &str,
        name: &str,
        descriptor: Descriptor,
    ) -> Result<(), StoreError> {
        if let Some(expected) = self.dimension() {
            // Replacing the sole entry may change the dimension; anything
            // else must match the roster.
            let sole_replacement = self.len() == 1 && self.contains(student_id);
            if descriptor.dimension() != expected && !sole_replacement {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: descriptor.dimension(),
                });
            }
        }

        match self.entries.iter_mut().find(|e| e.student_id == student_id) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.descriptor = descriptor;
            }
            None => self.entries.push(RosterEntry {
                student_id: student_id.to_string(),
                name: name.to_string(),
                descriptor,
            }),
        }

        tracing::info!(student_id, name, count = self.len(), "roster upsert");
        self.persist()
    }

    /// Delete every entry matching `student_id` (defensive against
    /// accidental duplicates), then persist. Returns whether anything was
    /// removed.
    pub fn remove(&mut self, student_id: &str) -> Result<bool, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.student_id != student_id);
        let removed = self.entries.len() != before;
        if removed {
            tracing::info!(student_id, count = self.len(), "roster remove");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Rewrite the whole roster file via a temp file and atomic rename.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = RosterFile {
            ids: self.entries.iter().map(|e| e.student_id.clone()).collect(),
            names: self.entries.iter().map(|e| e.name.clone()).collect(),
            descriptors: self.entries.iter().map(|e| e.descriptor.values.clone()).collect(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(&file)
            .map_err(|e| StoreError::Corrupt(format!("serialize: {e}")))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Ordered (student_id, name) pairs for inventory display.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.student_id.clone(), e.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_roster_path() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "rollcall-roster-test-{}-{n}.json",
            std::process::id()
        ))
    }

    fn descriptor(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    #[test]
    fn test_load_absent_file_is_empty() {
        let store = RosterStore::load(temp_roster_path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_upsert_new_grows_by_one() {
        let mut store = RosterStore::in_memory();
        store.upsert("S1", "Aliya", descriptor(&[0.1, 0.2])).unwrap();
        assert_eq!(store.len(), 1);
        store.upsert("S2", "Bekzod", descriptor(&[0.3, 0.4])).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_upsert_existing_keeps_size_and_position() {
        let mut store = RosterStore::in_memory();
        store.upsert("S1", "Aliya", descriptor(&[0.1, 0.2])).unwrap();
        store.upsert("S2", "Bekzod", descriptor(&[0.3, 0.4])).unwrap();
        store.upsert("S1", "Aliya K.", descriptor(&[0.5, 0.6])).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.entries()[0].student_id, "S1");
        assert_eq!(store.entries()[0].name, "Aliya K.");
        assert_eq!(store.entries()[0].descriptor.values, vec![0.5, 0.6]);
    }

    #[test]
    fn test_upsert_rejects_mismatched_dimension() {
        let mut store = RosterStore::in_memory();
        store.upsert("S1", "Aliya", descriptor(&[0.1, 0.2])).unwrap();
        let err = store.upsert("S2", "Bekzod", descriptor(&[0.1, 0.2, 0.3]));
        assert!(matches!(err, Err(StoreError::DimensionMismatch { expected: 2, actual: 3 })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_deletes_and_reports() {
        let mut store = RosterStore::in_memory();
        store.upsert("S1", "Aliya", descriptor(&[0.1, 0.2])).unwrap();
        assert!(store.remove("S1").unwrap());
        assert!(store.is_empty());
        assert!(!store.remove("S1").unwrap());
    }

    #[test]
    fn test_persist_and_reload_roundtrip() {
        let path = temp_roster_path();
        {
            let mut store = RosterStore::load(&path).unwrap();
            store.upsert("S1", "Aliya", descriptor(&[0.1, 0.2])).unwrap();
            store.upsert("S2", "Bekzod", descriptor(&[0.3, 0.4])).unwrap();
        }

        let store = RosterStore::load(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot(), vec![
            ("S1".to_string(), "Aliya".to_string()),
            ("S2".to_string(), "Bekzod".to_string()),
        ]);
        assert_eq!(store.entries()[1].descriptor.values, vec![0.3, 0.4]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_persisted_layout_is_parallel_sequences() {
        let path = temp_roster_path();
        let mut store = RosterStore::load(&path).unwrap();
        store.upsert("S1", "Aliya", descriptor(&[0.1, 0.2])).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["ids"][0], "S1");
        assert_eq!(parsed["names"][0], "Aliya");
        assert_eq!(parsed["descriptors"][0].as_array().unwrap().len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_unequal_sequences() {
        let path = temp_roster_path();
        fs::write(&path, r#"{"ids":["S1"],"names":[],"descriptors":[[0.1]]}"#).unwrap();
        assert!(matches!(RosterStore::load(&path), Err(StoreError::Corrupt(_))));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_mixed_dimensions() {
        let path = temp_roster_path();
        fs::write(
            &path,
            r#"{"ids":["S1","S2"],"names":["A","B"],"descriptors":[[0.1],[0.1,0.2]]}"#,
        )
        .unwrap();
        assert!(matches!(RosterStore::load(&path), Err(StoreError::Corrupt(_))));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_persist_failure_keeps_memory_authoritative() {
        let mut store = RosterStore {
            path: Some(PathBuf::from("/proc/rollcall-no-such-dir/roster.json")),
            entries: Vec::new(),
        };
        let result = store.upsert("S1", "Aliya", descriptor(&[0.1]));
        assert!(result.is_err());
        // The mutation stands; memory stays usable until the next
        // successful persist.
        assert_eq!(store.len(), 1);
        assert!(store.contains("S1"));
    }

    #[test]
    fn test_duplicate_ids_all_removed() {
        // Duplicates can only enter through a hand-edited file; remove()
        // must clear all of them.
        let mut store = RosterStore::in_memory();
        store.entries.push(RosterEntry {
            student_id: "S1".into(),
            name: "A".into(),
            descriptor: descriptor(&[0.1]),
        });
        store.entries.push(RosterEntry {
            student_id: "S1".into(),
            name: "B".into(),
            descriptor: descriptor(&[0.2]),
        });
        assert!(store.remove("S1").unwrap());
        assert!(store.is_empty());
    }
}

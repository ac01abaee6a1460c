//! Persistence Module
//!
//! The engine keeps all durable state behind [`ProcessStore`]. A command
//! loads what it needs, mutates private copies, and hands the store a single
//! [`ChangeSet`] at commit time. Every updated or deleted record carries the
//! revision it was loaded with; a mismatch fails the whole commit with
//! [`StoreError::OptimisticLock`].
//!
//! - [`memory`]: In-process store with version checks
//! - [`snapshot`]: JSON snapshots of the in-memory store

pub mod memory;
pub mod snapshot;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::jobs::Job;
use crate::runtime::{
    Execution, HistoricActivityInstance, HistoricProcessInstance, HistoricVariableUpdate,
    HistoryEvent, VariableInstance,
};

pub use memory::MemoryStore;
pub use snapshot::default_snapshot_path;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' was modified or removed by another transaction")]
    OptimisticLock { entity: &'static str, id: String },

    #[error("{entity} '{id}' already exists")]
    Duplicate { entity: &'static str, id: String },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A versioned record the store tracks.
pub trait Entity: Clone + PartialEq {
    /// Name used in error messages
    const KIND: &'static str;

    fn entity_id(&self) -> &str;
    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);
}

/// Inserts, updates and deletes of one entity type.
///
/// Updated records and deletes carry the revision they were loaded with.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChanges<T> {
    pub inserted: Vec<T>,
    pub updated: Vec<T>,
    pub deleted: Vec<(String, u64)>,
}

impl<T> Default for EntityChanges<T> {
    fn default() -> Self {
        Self {
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T: Entity> EntityChanges<T> {
    /// Compares the records as loaded with the records that should exist now.
    pub fn diff<'a>(original: &BTreeMap<String, T>, current: impl Iterator<Item = &'a T>) -> Self
    where
        T: 'a,
    {
        let mut changes = Self::default();
        let mut seen = std::collections::HashSet::new();

        for entity in current {
            seen.insert(entity.entity_id().to_string());
            match original.get(entity.entity_id()) {
                None => changes.inserted.push(entity.clone()),
                Some(loaded) if loaded != entity => changes.updated.push(entity.clone()),
                Some(_) => {}
            }
        }

        for (id, loaded) in original {
            if !seen.contains(id) {
                changes.deleted.push((id.clone(), loaded.revision()));
            }
        }
        changes
    }

    pub fn extend(&mut self, other: Self) {
        self.inserted.extend(other.inserted);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything one command wants to persist, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub executions: EntityChanges<Execution>,
    pub variables: EntityChanges<VariableInstance>,
    pub jobs: EntityChanges<Job>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.executions.len() + self.variables.len() + self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable storage for executions, variables, jobs and history.
pub trait ProcessStore: Send + Sync {
    /// Generates a new unique id.
    fn next_id(&self) -> String;

    fn find_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    /// All executions of one process instance.
    fn load_executions(&self, process_instance_id: &str) -> Result<Vec<Execution>, StoreError>;

    /// All variables of one process instance, across its scopes.
    fn load_variables(&self, process_instance_id: &str) -> Result<Vec<VariableInstance>, StoreError>;

    fn find_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    fn jobs_for_process_instance(&self, process_instance_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Due, unlocked (or lock expired) jobs with retries left, oldest first.
    fn find_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Jobs whose retries are exhausted.
    fn dead_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Applies a change set atomically, checking revisions.
    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;

    /// Appends history. Called after a successful commit.
    fn record_history(&self, events: &[HistoryEvent]) -> Result<(), StoreError>;

    fn historic_process_instance(&self, id: &str) -> Result<Option<HistoricProcessInstance>, StoreError>;

    fn historic_activities(&self, process_instance_id: &str) -> Result<Vec<HistoricActivityInstance>, StoreError>;

    fn variable_history(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableUpdate>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: String,
        revision: u64,
        value: u32,
    }

    impl Entity for Row {
        const KIND: &'static str = "row";

        fn entity_id(&self) -> &str {
            &self.id
        }

        fn revision(&self) -> u64 {
            self.revision
        }

        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
    }

    fn row(id: &str, revision: u64, value: u32) -> Row {
        Row {
            id: id.to_string(),
            revision,
            value,
        }
    }

    #[test]
    fn test_diff_classifies_changes() {
        let mut original = BTreeMap::new();
        original.insert("a".to_string(), row("a", 1, 1));
        original.insert("b".to_string(), row("b", 4, 2));
        original.insert("c".to_string(), row("c", 2, 3));

        let current = vec![row("a", 1, 1), row("b", 4, 20), row("d", 0, 4)];
        let changes = EntityChanges::diff(&original, current.iter());

        assert_eq!(changes.inserted, vec![row("d", 0, 4)]);
        assert_eq!(changes.updated, vec![row("b", 4, 20)]);
        assert_eq!(changes.deleted, vec![("c".to_string(), 2)]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        let mut original = BTreeMap::new();
        original.insert("a".to_string(), row("a", 1, 1));
        let current = vec![row("a", 1, 1)];

        assert!(EntityChanges::diff(&original, current.iter()).is_empty());
    }
}

//! In-Memory Store
//!
//! Keeps every table behind one mutex. A commit first verifies all revisions
//! of the change set and only then applies it, so a conflicting commit
//! leaves the store untouched.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{ChangeSet, Entity, EntityChanges, ProcessStore, StoreError};
use crate::jobs::Job;
use crate::runtime::{
    Execution, HistoricActivityInstance, HistoricProcessInstance, HistoricVariableUpdate,
    HistoryEvent, VariableInstance,
};

/// All tables of the in-memory store.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoreData {
    pub(crate) id_counter: u64,
    pub(crate) executions: BTreeMap<String, Execution>,
    pub(crate) variables: BTreeMap<String, VariableInstance>,
    pub(crate) jobs: BTreeMap<String, Job>,
    #[serde(default)]
    pub(crate) historic_process_instances: BTreeMap<String, HistoricProcessInstance>,
    #[serde(default)]
    pub(crate) historic_activities: Vec<HistoricActivityInstance>,
    #[serde(default)]
    pub(crate) variable_updates: Vec<HistoricVariableUpdate>,
}

/// Thread-safe in-memory [`ProcessStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_data(data: StoreData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored executions, across all instances.
    pub fn execution_count(&self) -> usize {
        self.lock().executions.len()
    }

    pub fn variable_count(&self) -> usize {
        self.lock().variables.len()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

fn verify<T: Entity>(table: &BTreeMap<String, T>, changes: &EntityChanges<T>) -> Result<(), StoreError> {
    for entity in &changes.inserted {
        if table.contains_key(entity.entity_id()) {
            return Err(StoreError::Duplicate {
                entity: T::KIND,
                id: entity.entity_id().to_string(),
            });
        }
    }

    let expected = changes
        .updated
        .iter()
        .map(|e| (e.entity_id(), e.revision()))
        .chain(changes.deleted.iter().map(|(id, rev)| (id.as_str(), *rev)));

    for (id, revision) in expected {
        match table.get(id) {
            Some(stored) if stored.revision() == revision => {}
            _ => {
                return Err(StoreError::OptimisticLock {
                    entity: T::KIND,
                    id: id.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn apply<T: Entity>(table: &mut BTreeMap<String, T>, changes: EntityChanges<T>) {
    for mut entity in changes.inserted {
        entity.set_revision(1);
        table.insert(entity.entity_id().to_string(), entity);
    }
    for mut entity in changes.updated {
        entity.set_revision(entity.revision() + 1);
        table.insert(entity.entity_id().to_string(), entity);
    }
    for (id, _) in changes.deleted {
        table.remove(&id);
    }
}

impl ProcessStore for MemoryStore {
    fn next_id(&self) -> String {
        let mut data = self.lock();
        data.id_counter += 1;
        data.id_counter.to_string()
    }

    fn find_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.lock().executions.get(id).cloned())
    }

    fn load_executions(&self, process_instance_id: &str) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .lock()
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    fn load_variables(&self, process_instance_id: &str) -> Result<Vec<VariableInstance>, StoreError> {
        Ok(self
            .lock()
            .variables
            .values()
            .filter(|v| v.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    fn find_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    fn jobs_for_process_instance(&self, process_instance_id: &str) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.process_instance_id.as_deref() == Some(process_instance_id))
            .cloned()
            .collect())
    }

    fn find_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        jobs.sort_by_key(Job::acquisition_key);
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn dead_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_dead())
            .cloned()
            .collect())
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut data = self.lock();

        verify(&data.executions, &changes.executions)?;
        verify(&data.variables, &changes.variables)?;
        verify(&data.jobs, &changes.jobs)?;

        debug!(
            "Applying change set: {} executions, {} variables, {} jobs",
            changes.executions.len(),
            changes.variables.len(),
            changes.jobs.len()
        );

        apply(&mut data.executions, changes.executions);
        apply(&mut data.variables, changes.variables);
        apply(&mut data.jobs, changes.jobs);
        Ok(())
    }

    fn record_history(&self, events: &[HistoryEvent]) -> Result<(), StoreError> {
        let mut data = self.lock();

        for event in events {
            match event {
                HistoryEvent::ProcessStarted {
                    process_instance_id,
                    process_definition_id,
                    business_key,
                    time,
                } => {
                    data.historic_process_instances.insert(
                        process_instance_id.clone(),
                        HistoricProcessInstance {
                            id: process_instance_id.clone(),
                            process_definition_id: process_definition_id.clone(),
                            business_key: business_key.clone(),
                            start_time: *time,
                            end_time: None,
                            end_reason: None,
                            deleted: false,
                        },
                    );
                }
                HistoryEvent::ProcessEnded {
                    process_instance_id,
                    reason,
                    deleted,
                    time,
                } => {
                    if let Some(instance) = data.historic_process_instances.get_mut(process_instance_id) {
                        instance.end_time = Some(*time);
                        instance.end_reason = Some(reason.clone());
                        instance.deleted = *deleted;
                    }
                }
                HistoryEvent::ActivityStarted {
                    process_instance_id,
                    execution_id,
                    activity_id,
                    time,
                } => data.historic_activities.push(HistoricActivityInstance {
                    process_instance_id: process_instance_id.clone(),
                    execution_id: execution_id.clone(),
                    activity_id: activity_id.clone(),
                    start_time: *time,
                    end_time: None,
                }),
                HistoryEvent::ActivityEnded {
                    execution_id,
                    activity_id,
                    time,
                    ..
                } => {
                    let open = data.historic_activities.iter_mut().rev().find(|a| {
                        a.execution_id == *execution_id
                            && a.activity_id == *activity_id
                            && a.end_time.is_none()
                    });
                    if let Some(activity) = open {
                        activity.end_time = Some(*time);
                    }
                }
                HistoryEvent::VariableUpdated(update) => data.variable_updates.push(update.clone()),
            }
        }
        Ok(())
    }

    fn historic_process_instance(&self, id: &str) -> Result<Option<HistoricProcessInstance>, StoreError> {
        Ok(self.lock().historic_process_instances.get(id).cloned())
    }

    fn historic_activities(&self, process_instance_id: &str) -> Result<Vec<HistoricActivityInstance>, StoreError> {
        Ok(self
            .lock()
            .historic_activities
            .iter()
            .filter(|a| a.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    fn variable_history(&self, process_instance_id: &str) -> Result<Vec<HistoricVariableUpdate>, StoreError> {
        Ok(self
            .lock()
            .variable_updates
            .iter()
            .filter(|u| u.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use chrono::Duration;
    use serde_json::json;

    fn insert_execution(store: &MemoryStore, execution: Execution) {
        let mut changes = ChangeSet::default();
        changes.executions.inserted.push(execution);
        store.commit(changes).unwrap();
    }

    #[test]
    fn test_ids_are_sequential() {
        let store = MemoryStore::new();
        assert_eq!(store.next_id(), "1");
        assert_eq!(store.next_id(), "2");
    }

    #[test]
    fn test_insert_sets_first_revision() {
        let store = MemoryStore::new();
        insert_execution(&store, Execution::new_root("1", "p", None));

        let loaded = store.find_execution("1").unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(store.load_executions("1").unwrap().len(), 1);
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let store = MemoryStore::new();
        insert_execution(&store, Execution::new_root("1", "p", None));

        let first = store.find_execution("1").unwrap().unwrap();
        let second = first.clone();

        let mut a = first;
        a.activity_id = Some("a".to_string());
        let mut changes = ChangeSet::default();
        changes.executions.updated.push(a);
        store.commit(changes).unwrap();

        let mut b = second;
        b.activity_id = Some("b".to_string());
        let mut changes = ChangeSet::default();
        changes.executions.updated.push(b);
        let err = store.commit(changes).unwrap_err();

        assert!(matches!(err, StoreError::OptimisticLock { entity: "execution", .. }));
        let stored = store.find_execution("1").unwrap().unwrap();
        assert_eq!(stored.activity_id.as_deref(), Some("a"));
        assert_eq!(stored.revision, 2);
    }

    #[test]
    fn test_failed_commit_applies_nothing() {
        let store = MemoryStore::new();
        insert_execution(&store, Execution::new_root("1", "p", None));

        let mut changes = ChangeSet::default();
        changes.executions.inserted.push(Execution::new_root("2", "p", None));
        changes.executions.deleted.push(("1".to_string(), 99));

        assert!(store.commit(changes).is_err());
        assert!(store.find_execution("2").unwrap().is_none());
        assert!(store.find_execution("1").unwrap().is_some());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        insert_execution(&store, Execution::new_root("1", "p", None));

        let mut changes = ChangeSet::default();
        changes.executions.inserted.push(Execution::new_root("1", "p", None));
        assert!(matches!(store.commit(changes), Err(StoreError::Duplicate { .. })));
    }

    #[test]
    fn test_acquirable_jobs_ordering_and_filtering() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut changes = ChangeSet::default();

        let later = Job::new("10", JobKind::Message, "x", json!(null), 3, now);
        let earlier = Job::new("9", JobKind::Message, "x", json!(null), 3, now);
        let future = Job::new("11", JobKind::Timer, "x", json!(null), 3, now).due_at(now + Duration::hours(1));
        let mut dead = Job::new("12", JobKind::Message, "x", json!(null), 0, now);
        dead.exception_message = Some("boom".to_string());
        let mut locked = Job::new("13", JobKind::Message, "x", json!(null), 3, now);
        locked.lock("other", now + Duration::minutes(5));

        changes.jobs.inserted.extend(vec![later, earlier, future, dead, locked]);
        store.commit(changes).unwrap();

        let ids: Vec<String> = store
            .find_acquirable_jobs(now, 10)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["9".to_string(), "10".to_string()]);

        assert_eq!(store.find_acquirable_jobs(now, 1).unwrap().len(), 1);
        assert_eq!(store.dead_jobs().unwrap().len(), 1);
        assert_eq!(store.find_acquirable_jobs(now + Duration::hours(2), 10).unwrap().len(), 4);
    }

    #[test]
    fn test_activity_history_closes_latest_open_visit() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);

        store
            .record_history(&[
                HistoryEvent::ActivityStarted {
                    process_instance_id: "1".to_string(),
                    execution_id: "1".to_string(),
                    activity_id: "task".to_string(),
                    time: t0,
                },
                HistoryEvent::ActivityEnded {
                    process_instance_id: "1".to_string(),
                    execution_id: "1".to_string(),
                    activity_id: "task".to_string(),
                    time: t1,
                },
            ])
            .unwrap();

        let activities = store.historic_activities("1").unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].end_time, Some(t1));
    }
}

//! Execution Tree
//!
//! Runtime threads of control for one process instance, kept in an arena
//! keyed by execution id. Parent and child links are ids, never references,
//! so a tree can be snapshotted, diffed against its loaded state and written
//! back as a change set.
//!
//! Shape of a forked instance:
//!
//! ```text
//! root (scope, inactive, at fork gateway)
//!  ├── 4 (concurrent, at TaskA)
//!  └── 5 (concurrent, at TaskB)
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::store::{Entity, EntityChanges};

/// Address of an execution: its process instance plus its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionRef {
    pub process_instance_id: String,
    pub execution_id: String,
}

impl ExecutionRef {
    pub fn new(process_instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            process_instance_id: process_instance_id.into(),
            execution_id: execution_id.into(),
        }
    }

    /// Reference to the root execution of an instance.
    pub fn root(process_instance_id: impl Into<String>) -> Self {
        let id = process_instance_id.into();
        Self::new(id.clone(), id)
    }
}

impl std::fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.execution_id)
    }
}

/// One thread of control inside a process instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Execution {
    pub id: String,

    /// Optimistic version, bumped by the store on every update
    #[serde(default)]
    pub revision: u64,

    pub process_instance_id: String,
    pub process_definition_id: String,

    /// None for the process-instance root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Live children in creation order
    #[serde(default)]
    pub children: Vec<String>,

    /// Node the execution currently sits at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,

    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    #[serde(default)]
    pub is_ended: bool,
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
}

impl Execution {
    /// Creates the root execution of a new process instance.
    pub fn new_root(
        id: impl Into<String>,
        process_definition_id: impl Into<String>,
        business_key: Option<String>,
    ) -> Self {
        let id = id.into();
        Self {
            process_instance_id: id.clone(),
            id,
            revision: 0,
            process_definition_id: process_definition_id.into(),
            parent_id: None,
            children: Vec::new(),
            activity_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            is_ended: false,
            is_deleted: false,
            delete_reason: None,
            business_key,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Not ended and not deleted.
    pub fn is_live(&self) -> bool {
        !self.is_ended && !self.is_deleted
    }

    pub fn to_ref(&self) -> ExecutionRef {
        ExecutionRef::new(&self.process_instance_id, &self.id)
    }
}

impl Entity for Execution {
    const KIND: &'static str = "execution";

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

/// Arena of executions for one process instance.
///
/// Ended and deleted executions stay in the arena until the owning command
/// finishes so queued operations can still see that they are gone.
#[derive(Debug, Clone)]
pub struct ExecutionTree {
    process_instance_id: String,
    executions: BTreeMap<String, Execution>,
    original: BTreeMap<String, Execution>,
    forced: BTreeSet<String>,
}

impl ExecutionTree {
    /// Starts a tree for a brand-new instance.
    pub fn new(root: Execution) -> Self {
        let process_instance_id = root.process_instance_id.clone();
        let mut executions = BTreeMap::new();
        executions.insert(root.id.clone(), root);
        Self {
            process_instance_id,
            executions,
            original: BTreeMap::new(),
            forced: BTreeSet::new(),
        }
    }

    /// Rebuilds a tree from persisted executions.
    pub fn from_loaded(process_instance_id: impl Into<String>, loaded: Vec<Execution>) -> Self {
        let executions: BTreeMap<String, Execution> = loaded
            .into_iter()
            .map(|execution| (execution.id.clone(), execution))
            .collect();
        Self {
            process_instance_id: process_instance_id.into(),
            original: executions.clone(),
            executions,
            forced: BTreeSet::new(),
        }
    }

    pub fn process_instance_id(&self) -> &str {
        &self.process_instance_id
    }

    pub fn root(&self) -> Option<&Execution> {
        self.executions.get(&self.process_instance_id)
    }

    pub fn get(&self, id: &str) -> Option<&Execution> {
        self.executions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Execution> {
        self.executions.get_mut(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.executions.get(id).map_or(false, Execution::is_live)
    }

    /// Executions that are neither ended nor deleted.
    pub fn live_executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values().filter(|e| e.is_live())
    }

    pub fn live_children(&self, id: &str) -> Vec<&Execution> {
        self.executions
            .get(id)
            .map(|parent| {
                parent
                    .children
                    .iter()
                    .filter_map(|child| self.executions.get(child))
                    .filter(|child| child.is_live())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Creates a child with a cleared activity, active, neither concurrent nor scope.
    ///
    /// Returns None when the parent does not exist.
    pub fn create_child(&mut self, parent_id: &str, id: impl Into<String>) -> Option<&mut Execution> {
        let id = id.into();
        let parent = self.executions.get_mut(parent_id)?;
        if !parent.children.contains(&id) {
            parent.children.push(id.clone());
        }
        let child = Execution {
            id: id.clone(),
            revision: 0,
            process_instance_id: parent.process_instance_id.clone(),
            process_definition_id: parent.process_definition_id.clone(),
            parent_id: Some(parent_id.to_string()),
            children: Vec::new(),
            activity_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: false,
            is_ended: false,
            is_deleted: false,
            delete_reason: None,
            business_key: None,
        };
        self.executions.insert(id.clone(), child);
        self.executions.get_mut(&id)
    }

    /// Marks an execution ended and detaches it from its parent.
    pub fn end(&mut self, id: &str, reason: &str) -> bool {
        let parent_id = match self.executions.get_mut(id) {
            Some(execution) if execution.is_live() => {
                execution.is_ended = true;
                execution.is_active = false;
                execution.delete_reason = Some(reason.to_string());
                execution.parent_id.clone()
            }
            _ => return false,
        };
        if let Some(parent) = parent_id.and_then(|p| self.executions.get_mut(&p)) {
            parent.children.retain(|child| child != id);
        }
        true
    }

    /// Marks an execution deleted (and ended) and detaches it from its parent.
    pub fn delete(&mut self, id: &str, reason: &str) -> bool {
        let was_live = self.is_live(id);
        if was_live {
            self.end(id, reason);
        }
        match self.executions.get_mut(id) {
            Some(execution) => {
                execution.is_deleted = true;
                execution.delete_reason = Some(reason.to_string());
                was_live
            }
            None => false,
        }
    }

    /// Deletes every descendant of `id`, deepest first, leaving `id` itself.
    ///
    /// Returns the removed ids so the caller can drop their variables and jobs.
    pub fn destroy_scope(&mut self, id: &str, reason: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let children = self
            .executions
            .get(id)
            .map(|e| e.children.clone())
            .unwrap_or_default();

        for child in children {
            removed.extend(self.destroy_scope(&child, reason));
            if self.delete(&child, reason) {
                removed.push(child);
            }
        }
        removed
    }

    /// Live descendants of an execution, deepest first.
    pub fn live_descendants(&self, id: &str) -> Vec<String> {
        let mut found = Vec::new();
        if let Some(execution) = self.executions.get(id) {
            for child in &execution.children {
                found.extend(self.live_descendants(child));
                if self.is_live(child) {
                    found.push(child.clone());
                }
            }
        }
        found
    }

    /// Scope-owning executions from `id` up to the root, nearest first.
    pub fn scope_chain(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.executions.get(id);
        while let Some(execution) = current {
            if execution.is_scope {
                chain.push(execution.id.clone());
            }
            current = execution
                .parent_id
                .as_deref()
                .and_then(|p| self.executions.get(p));
        }
        chain
    }

    /// The scope execution a concurrent branch belongs to; the execution itself otherwise.
    pub fn concurrency_root(&self, id: &str) -> Option<String> {
        let execution = self.executions.get(id)?;
        if execution.is_concurrent {
            execution.parent_id.clone()
        } else {
            Some(execution.id.clone())
        }
    }

    /// Live, inactive children of `root_id` waiting at `activity_id`.
    pub fn inactive_children_at(&self, root_id: &str, activity_id: &str) -> Vec<String> {
        self.live_children(root_id)
            .into_iter()
            .filter(|child| !child.is_active && child.activity_id.as_deref() == Some(activity_id))
            .map(|child| child.id.clone())
            .collect()
    }

    /// Executions still waiting in a node.
    pub fn active_activities(&self) -> Vec<String> {
        self.live_executions()
            .filter(|e| e.is_active)
            .filter_map(|e| e.activity_id.clone())
            .collect()
    }

    /// Writes a loaded execution back even when it is unchanged, so a
    /// concurrent commit touching the same execution conflicts.
    pub fn force_update(&mut self, id: &str) {
        self.forced.insert(id.to_string());
    }

    /// Differences between the loaded state and the current state.
    pub fn changes(&self) -> EntityChanges<Execution> {
        let mut changes = EntityChanges::diff(&self.original, self.executions.values().filter(|e| e.is_live()));
        for id in &self.forced {
            let unchanged = self.original.get(id) == self.executions.get(id);
            if let (true, Some(execution)) = (unchanged, self.executions.get(id).filter(|e| e.is_live())) {
                changes.updated.push(execution.clone());
            }
        }
        changes
    }

    /// Checks the structural invariants of the tree.
    pub fn check_invariants(&self) -> Result<(), String> {
        let roots: Vec<&Execution> = self.live_executions().filter(|e| e.is_root()).collect();
        if roots.len() > 1 {
            return Err(format!("{} root executions", roots.len()));
        }

        for execution in self.executions.values() {
            if execution.is_active && execution.is_ended {
                return Err(format!("execution {} is active and ended", execution.id));
            }
            if !execution.is_live() {
                continue;
            }
            if execution.is_concurrent {
                let parent = execution
                    .parent_id
                    .as_deref()
                    .and_then(|p| self.executions.get(p))
                    .ok_or_else(|| format!("concurrent execution {} has no parent", execution.id))?;
                if !parent.is_scope {
                    return Err(format!(
                        "concurrent execution {} has a non-scope parent {}",
                        execution.id, parent.id
                    ));
                }
            }
            let mut seen = std::collections::HashSet::new();
            for child in &execution.children {
                if !seen.insert(child) {
                    return Err(format!("execution {} lists child {} twice", execution.id, child));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ExecutionTree {
        let mut root = Execution::new_root("1", "proc", None);
        root.activity_id = Some("start".to_string());
        ExecutionTree::new(root)
    }

    fn concurrent_child(tree: &mut ExecutionTree, parent: &str, id: &str, activity: &str) {
        let child = tree.create_child(parent, id).unwrap();
        child.is_concurrent = true;
        child.activity_id = Some(activity.to_string());
    }

    #[test]
    fn test_create_child_defaults() {
        let mut tree = tree();
        let child = tree.create_child("1", "2").unwrap();

        assert_eq!(child.process_instance_id, "1");
        assert_eq!(child.process_definition_id, "proc");
        assert!(child.activity_id.is_none());
        assert!(child.is_active);
        assert!(!child.is_concurrent);
        assert!(!child.is_scope);
        assert_eq!(tree.get("1").unwrap().children, vec!["2".to_string()]);
    }

    #[test]
    fn test_create_child_unknown_parent() {
        let mut tree = tree();
        assert!(tree.create_child("missing", "2").is_none());
    }

    #[test]
    fn test_end_detaches_from_parent() {
        let mut tree = tree();
        concurrent_child(&mut tree, "1", "2", "a");
        concurrent_child(&mut tree, "1", "3", "b");

        assert!(tree.end("2", "completed"));
        assert!(!tree.is_live("2"));
        assert!(!tree.get("2").unwrap().is_active);
        assert_eq!(tree.live_children("1").len(), 1);
        assert!(!tree.end("2", "completed"));
    }

    #[test]
    fn test_destroy_scope_removes_descendants_only() {
        let mut tree = tree();
        concurrent_child(&mut tree, "1", "2", "sub");
        tree.create_child("2", "3").unwrap().is_scope = true;
        tree.create_child("3", "4").unwrap();

        let removed = tree.destroy_scope("1", "terminated");

        assert_eq!(removed, vec!["4".to_string(), "3".to_string(), "2".to_string()]);
        assert!(tree.is_live("1"));
        assert!(tree.get("4").unwrap().is_deleted);
        assert!(tree.live_children("1").is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_live_descendants_match_destroy_order() {
        let mut tree = tree();
        concurrent_child(&mut tree, "1", "2", "sub");
        tree.create_child("2", "3").unwrap().is_scope = true;
        tree.create_child("3", "4").unwrap();
        concurrent_child(&mut tree, "1", "5", "b");
        tree.end("5", "completed");

        let doomed = tree.live_descendants("1");
        assert_eq!(doomed, vec!["4".to_string(), "3".to_string(), "2".to_string()]);
        assert_eq!(tree.destroy_scope("1", "terminated"), doomed);
    }

    #[test]
    fn test_scope_chain_skips_non_scope_executions() {
        let mut tree = tree();
        concurrent_child(&mut tree, "1", "2", "sub");
        tree.create_child("2", "3").unwrap().is_scope = true;
        concurrent_child(&mut tree, "3", "4", "inner");

        assert_eq!(tree.scope_chain("4"), vec!["3".to_string(), "1".to_string()]);
        assert_eq!(tree.scope_chain("2"), vec!["1".to_string()]);
        assert!(tree.scope_chain("missing").is_empty());
    }

    #[test]
    fn test_concurrency_root() {
        let mut tree = tree();
        concurrent_child(&mut tree, "1", "2", "a");

        assert_eq!(tree.concurrency_root("2"), Some("1".to_string()));
        assert_eq!(tree.concurrency_root("1"), Some("1".to_string()));
    }

    #[test]
    fn test_inactive_children_at() {
        let mut tree = tree();
        concurrent_child(&mut tree, "1", "2", "join");
        concurrent_child(&mut tree, "1", "3", "join");
        concurrent_child(&mut tree, "1", "4", "task");
        tree.get_mut("2").unwrap().is_active = false;

        assert_eq!(tree.inactive_children_at("1", "join"), vec!["2".to_string()]);
    }

    #[test]
    fn test_changes_against_loaded_state() {
        let mut root = Execution::new_root("1", "proc", None);
        root.revision = 3;
        root.activity_id = Some("task".to_string());
        let mut tree = ExecutionTree::from_loaded("1", vec![root]);

        assert!(tree.changes().is_empty());

        tree.get_mut("1").unwrap().activity_id = Some("next".to_string());
        tree.create_child("1", "2");

        let changes = tree.changes();
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].revision, 3);

        tree.end("1", "completed");
        tree.end("2", "completed");
        let changes = tree.changes();
        assert_eq!(changes.deleted, vec![("1".to_string(), 3)]);
        assert!(changes.inserted.is_empty());
    }

    #[test]
    fn test_forced_update_of_unchanged_execution() {
        let mut root = Execution::new_root("1", "proc", None);
        root.revision = 2;
        let mut tree = ExecutionTree::from_loaded("1", vec![root]);

        tree.force_update("1");
        tree.force_update("missing");

        let changes = tree.changes();
        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].revision, 2);
    }

    #[test]
    fn test_invariant_violation_detected() {
        let mut tree = tree();
        tree.create_child("1", "2").unwrap();
        tree.get_mut("1").unwrap().children.push("2".to_string());

        assert!(tree.check_invariants().is_err());
    }
}

//! Deployed Processes
//!
//! A validated definition compiled for the interpreter: nodes indexed by id,
//! one [`Behavior`] bound per node, outgoing flows in declaration order and
//! guards parsed once.
//!
//! Deployments are immutable. Deploying a process id again adds a new
//! version under its own key (`order:2`); instances keep running on the
//! version they were started with.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::behavior::Behavior;
use crate::error::{DefinitionError, EngineError, EngineResult};
use crate::process::{Condition, FlowNode, ProcessDefinition, SequenceFlow};

/// A process definition ready to run.
#[derive(Debug)]
pub struct DeployedProcess {
    definition: ProcessDefinition,
    /// `id:version`, stored on executions and jobs
    key: String,
    version: u32,
    node_index: HashMap<String, usize>,
    behaviors: Vec<Behavior>,
    /// Outgoing flow indices per node, declaration order
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<usize>,
    conditions: Vec<Option<Condition>>,
}

impl DeployedProcess {
    /// Compiles a definition. Fails when a guard does not parse or a flow
    /// points at an unknown node.
    pub fn new(definition: ProcessDefinition) -> Result<Self, String> {
        let node_index: HashMap<String, usize> = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        let mut outgoing = vec![Vec::new(); definition.nodes.len()];
        let mut incoming = vec![0; definition.nodes.len()];
        let mut conditions = Vec::with_capacity(definition.flows.len());

        for (i, flow) in definition.flows.iter().enumerate() {
            let source = *node_index
                .get(&flow.source)
                .ok_or_else(|| format!("flow '{}' has unknown source '{}'", flow.id, flow.source))?;
            let target = *node_index
                .get(&flow.target)
                .ok_or_else(|| format!("flow '{}' has unknown target '{}'", flow.id, flow.target))?;
            outgoing[source].push(i);
            incoming[target] += 1;

            let condition = flow
                .condition
                .as_deref()
                .map(Condition::parse)
                .transpose()
                .map_err(|e| format!("flow '{}': {}", flow.id, e))?;
            conditions.push(condition);
        }

        let behaviors = definition.nodes.iter().map(Behavior::for_node).collect();
        let version = definition.version;

        Ok(Self {
            key: deployment_key(&definition.id, version),
            version,
            definition,
            node_index,
            behaviors,
            outgoing,
            incoming,
            conditions,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Key this version is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self.key = deployment_key(&self.definition.id, version);
        self
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.node_index
            .get(node_id)
            .map(|&i| &self.definition.nodes[i])
    }

    /// The node, or an `UnknownNode` error.
    pub fn require_node(&self, node_id: &str) -> EngineResult<&FlowNode> {
        self.node(node_id).ok_or_else(|| self.unknown(node_id))
    }

    pub fn behavior(&self, node_id: &str) -> EngineResult<&Behavior> {
        self.node_index
            .get(node_id)
            .map(|&i| &self.behaviors[i])
            .ok_or_else(|| self.unknown(node_id))
    }

    /// Outgoing flows with their parsed guards, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<(&SequenceFlow, Option<&Condition>)> {
        self.node_index
            .get(node_id)
            .map(|&i| {
                self.outgoing[i]
                    .iter()
                    .map(|&f| (&self.definition.flows[f], self.conditions[f].as_ref()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn incoming_count(&self, node_id: &str) -> usize {
        self.node_index
            .get(node_id)
            .map_or(0, |&i| self.incoming[i])
    }

    /// The start event of a scope (None = the process itself).
    pub fn start_event(&self, scope: Option<&str>) -> EngineResult<&FlowNode> {
        self.definition
            .start_events(scope)
            .into_iter()
            .next()
            .ok_or_else(|| {
                DefinitionError::MissingStartEvent {
                    process_id: self.definition.id.clone(),
                    scope: scope.unwrap_or("<process>").to_string(),
                }
                .into()
            })
    }

    /// True when a path of sequence flows leads from `from` to `to`.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        let (Some(&start), Some(&goal)) = (self.node_index.get(from), self.node_index.get(to)) else {
            return false;
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            for &flow in &self.outgoing[node] {
                let target = self.node_index[&self.definition.flows[flow].target];
                if target == goal {
                    return true;
                }
                queue.push_back(target);
            }
        }
        false
    }

    fn unknown(&self, node_id: &str) -> EngineError {
        DefinitionError::UnknownNode {
            process_id: self.definition.id.clone(),
            node_id: node_id.to_string(),
        }
        .into()
    }
}

fn deployment_key(id: &str, version: u32) -> String {
    format!("{}:{}", id, version)
}

/// Every deployed version, plus the latest version per process id.
#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    by_key: HashMap<String, Arc<DeployedProcess>>,
    latest: HashMap<String, u32>,
}

impl DeploymentRegistry {
    /// Adds a deployment as the newest version of its process id. The
    /// definition's own version is kept unless an equal or newer one is
    /// already deployed.
    pub fn register(&mut self, deployed: DeployedProcess) -> Arc<DeployedProcess> {
        let id = deployed.id().to_string();
        let version = match self.latest.get(&id) {
            Some(&latest) if deployed.version() <= latest => latest + 1,
            _ => deployed.version(),
        };

        let deployed = Arc::new(deployed.with_version(version));
        self.latest.insert(id, version);
        self.by_key.insert(deployed.key().to_string(), Arc::clone(&deployed));
        deployed
    }

    /// Looks up a deployment key, or the latest version of a process id.
    pub fn get(&self, key_or_id: &str) -> Option<Arc<DeployedProcess>> {
        if let Some(deployed) = self.by_key.get(key_or_id) {
            return Some(Arc::clone(deployed));
        }
        self.latest
            .get(key_or_id)
            .and_then(|&version| self.by_key.get(&deployment_key(key_or_id, version)))
            .cloned()
    }

    pub fn is_deployed(&self, id: &str) -> bool {
        self.latest.contains_key(id)
    }

    /// Process ids with at least one deployed version, sorted.
    pub fn process_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.latest.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deployed versions of a process id, oldest first.
    pub fn versions(&self, id: &str) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .by_key
            .values()
            .filter(|deployed| deployed.id() == id)
            .map(|deployed| deployed.version())
            .collect();
        versions.sort_unstable();
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NodeKind;

    fn diamond() -> ProcessDefinition {
        ProcessDefinition::new("p")
            .node(FlowNode::new("start", NodeKind::StartEvent))
            .node(FlowNode::new("fork", NodeKind::InclusiveGateway))
            .node(FlowNode::new("a", NodeKind::UserTask))
            .node(FlowNode::new("b", NodeKind::UserTask))
            .node(FlowNode::new("join", NodeKind::InclusiveGateway))
            .node(FlowNode::new("end", NodeKind::EndEvent { terminate: false }))
            .flow("f1", "start", "fork")
            .guarded_flow("f2", "fork", "a", "x > 1")
            .flow("f3", "fork", "b")
            .flow("f4", "a", "join")
            .flow("f5", "b", "join")
            .flow("f6", "join", "end")
    }

    #[test]
    fn test_compiled_lookup() {
        let deployed = DeployedProcess::new(diamond()).unwrap();

        assert_eq!(deployed.id(), "p");
        assert_eq!(deployed.incoming_count("join"), 2);
        assert_eq!(deployed.start_event(None).unwrap().id, "start");

        let outgoing = deployed.outgoing("fork");
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0].0.id, "f2");
        assert!(outgoing[0].1.is_some());
        assert!(outgoing[1].1.is_none());
    }

    #[test]
    fn test_reachability() {
        let deployed = DeployedProcess::new(diamond()).unwrap();

        assert!(deployed.can_reach("a", "join"));
        assert!(deployed.can_reach("start", "end"));
        assert!(!deployed.can_reach("join", "a"));
        assert!(!deployed.can_reach("a", "b"));
        assert!(!deployed.can_reach("a", "ghost"));
    }

    #[test]
    fn test_unknown_node_errors() {
        let deployed = DeployedProcess::new(diamond()).unwrap();

        let err = deployed.behavior("ghost").unwrap_err();
        assert!(err.is_definition_error());
        assert!(deployed.start_event(Some("fork")).is_err());
    }

    #[test]
    fn test_registry_keeps_every_version() {
        let mut registry = DeploymentRegistry::default();

        let first = registry.register(DeployedProcess::new(diamond()).unwrap());
        let second = registry.register(DeployedProcess::new(diamond()).unwrap());

        assert_eq!(first.key(), "p:1");
        assert_eq!(second.key(), "p:2");
        assert_eq!(registry.get("p").unwrap().key(), "p:2");
        assert_eq!(registry.get("p:1").unwrap().version(), 1);
        assert_eq!(registry.versions("p"), vec![1, 2]);
        assert_eq!(registry.process_ids(), vec!["p".to_string()]);
        assert!(registry.get("q").is_none());
    }

    #[test]
    fn test_registry_honors_newer_definition_version() {
        let mut registry = DeploymentRegistry::default();
        registry.register(DeployedProcess::new(diamond()).unwrap());

        let mut definition = diamond();
        definition.version = 7;
        let deployed = registry.register(DeployedProcess::new(definition).unwrap());

        assert_eq!(deployed.key(), "p:7");
        assert!(registry.is_deployed("p"));
    }

    #[test]
    fn test_bad_guard_rejected() {
        let def = diamond().guarded_flow("f7", "a", "end", "&&");
        assert!(DeployedProcess::new(def).is_err());
    }
}

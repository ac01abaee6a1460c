//! Process Graph Model
//!
//! The compiled graph a process instance runs on: typed nodes connected by
//! sequence flows with optional guard expressions.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: order
//! name: Order handling
//! nodes:
//!   - id: start
//!     type: start_event
//!   - id: check
//!     type: exclusive_gateway
//!     default_flow: to_manual
//!   - id: auto_approve
//!     type: service_task
//!     handler: approve
//!     async_before: true
//!   - id: manual_review
//!     type: user_task
//!   - id: end
//!     type: end_event
//! flows:
//!   - { id: f1, source: start, target: check }
//!   - { id: to_auto, source: check, target: auto_approve, condition: "amount <= 100" }
//!   - { id: to_manual, source: check, target: manual_review }
//!   - { id: f4, source: auto_approve, target: end }
//!   - { id: f5, source: manual_review, target: end }
//! ```

use serde::{Deserialize, Serialize};

/// Behavior type of a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    EndEvent {
        /// Tear down the whole enclosing scope instead of just this branch
        #[serde(default)]
        terminate: bool,
    },
    /// Passes straight through
    ManualTask,
    /// Waits for an external trigger
    UserTask,
    /// Waits for a message trigger
    ReceiveTask,
    /// Calls a registered task handler
    ServiceTask { handler: String },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    /// Waits until a timer job fires
    TimerEvent { duration_ms: u64 },
    /// Embedded sub-process with its own variable scope
    SubProcess,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartEvent => "start_event",
            Self::EndEvent { .. } => "end_event",
            Self::ManualTask => "manual_task",
            Self::UserTask => "user_task",
            Self::ReceiveTask => "receive_task",
            Self::ServiceTask { .. } => "service_task",
            Self::ExclusiveGateway => "exclusive_gateway",
            Self::ParallelGateway => "parallel_gateway",
            Self::InclusiveGateway => "inclusive_gateway",
            Self::TimerEvent { .. } => "timer_event",
            Self::SubProcess => "sub_process",
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            Self::ExclusiveGateway | Self::ParallelGateway | Self::InclusiveGateway
        )
    }
}

/// A node of the process graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowNode {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: NodeKind,

    /// Enclosing sub-process, None for top-level nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Enter this node from a job instead of the current command
    #[serde(default)]
    pub async_before: bool,

    /// Leave this node from a job instead of the current command
    #[serde(default)]
    pub async_after: bool,

    /// Flow taken when no guard holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_flow: Option<String>,

    /// Retries for jobs created at this node, overriding the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_retries: Option<u32>,
}

impl FlowNode {
    /// Creates a node of the given kind.
    ///
    /// # Example
    ///
    /// ```
    /// use procrunner::process::{FlowNode, NodeKind};
    ///
    /// let node = FlowNode::new("charge", NodeKind::ServiceTask { handler: "charge_card".into() })
    ///     .with_name("Charge card")
    ///     .async_before();
    /// assert!(node.async_before);
    /// ```
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: None,
            kind,
            parent: None,
            async_before: false,
            async_after: false,
            default_flow: None,
            job_retries: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Places the node inside a sub-process.
    pub fn within(mut self, sub_process: impl Into<String>) -> Self {
        self.parent = Some(sub_process.into());
        self
    }

    pub fn async_before(mut self) -> Self {
        self.async_before = true;
        self
    }

    pub fn async_after(mut self) -> Self {
        self.async_after = true;
        self
    }

    pub fn with_default_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.default_flow = Some(flow_id.into());
        self
    }

    pub fn with_job_retries(mut self, retries: u32) -> Self {
        self.job_retries = Some(retries);
        self
    }

    /// Display label: the name when set, the id otherwise.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A directed edge between two nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,

    /// Guard expression; a flow without one always holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SequenceFlow {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// An immutable, typed process graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub nodes: Vec<FlowNode>,

    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

fn default_version() -> u32 {
    1
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: 1,
            nodes: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a node (builder style).
    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds an unconditional flow (builder style).
    pub fn flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.flows.push(SequenceFlow::new(id, source, target));
        self
    }

    /// Adds a guarded flow (builder style).
    pub fn guarded_flow(mut self, id: &str, source: &str, target: &str, condition: &str) -> Self {
        self.flows
            .push(SequenceFlow::new(id, source, target).with_condition(condition));
        self
    }

    pub fn get_node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Outgoing flows in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.source == node_id).collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.target == node_id).collect()
    }

    /// Start events directly inside `scope` (None = top level).
    pub fn start_events(&self, scope: Option<&str>) -> Vec<&FlowNode> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::StartEvent && n.parent.as_deref() == scope)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProcessDefinition {
        ProcessDefinition::new("p")
            .node(FlowNode::new("start", NodeKind::StartEvent))
            .node(FlowNode::new("gw", NodeKind::ExclusiveGateway).with_default_flow("f3"))
            .node(FlowNode::new("a", NodeKind::UserTask))
            .node(FlowNode::new("b", NodeKind::UserTask))
            .flow("f1", "start", "gw")
            .guarded_flow("f2", "gw", "a", "x > 10")
            .flow("f3", "gw", "b")
    }

    #[test]
    fn test_builder() {
        let def = sample();
        assert_eq!(def.len(), 4);
        assert_eq!(def.version, 1);
        assert_eq!(def.get_flow("f2").unwrap().condition.as_deref(), Some("x > 10"));
    }

    #[test]
    fn test_outgoing_keeps_declaration_order() {
        let def = sample();
        let ids: Vec<&str> = def.outgoing("gw").iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f2", "f3"]);
        assert_eq!(def.incoming("gw").len(), 1);
    }

    #[test]
    fn test_start_events_by_scope() {
        let def = sample()
            .node(FlowNode::new("sub", NodeKind::SubProcess))
            .node(FlowNode::new("sub_start", NodeKind::StartEvent).within("sub"));

        assert_eq!(def.start_events(None)[0].id, "start");
        assert_eq!(def.start_events(Some("sub"))[0].id, "sub_start");
    }

    #[test]
    fn test_yaml_node_kinds() {
        let yaml = r#"
id: p
nodes:
  - id: start
    type: start_event
  - id: svc
    type: service_task
    handler: charge
    async_after: true
  - id: wait
    type: timer_event
    duration_ms: 500
  - id: end
    type: end_event
    terminate: true
flows: []
"#;
        let def: ProcessDefinition = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(def.nodes[0].kind, NodeKind::StartEvent);
        assert_eq!(
            def.nodes[1].kind,
            NodeKind::ServiceTask {
                handler: "charge".to_string()
            }
        );
        assert!(def.nodes[1].async_after);
        assert_eq!(def.nodes[2].kind, NodeKind::TimerEvent { duration_ms: 500 });
        assert_eq!(def.nodes[3].kind, NodeKind::EndEvent { terminate: true });
    }

    #[test]
    fn test_label_and_type_name() {
        let node = FlowNode::new(" review ", NodeKind::UserTask);
        assert_eq!(node.id, "review");
        assert_eq!(node.label(), "review");
        assert_eq!(node.with_name("Review order").label(), "Review order");
        assert_eq!(NodeKind::InclusiveGateway.type_name(), "inclusive_gateway");
        assert!(NodeKind::ParallelGateway.is_gateway());
    }
}

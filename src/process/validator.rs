//! Process Validation
//!
//! Structural checks run before a graph is deployed:
//! - Node and flow ids are present and unique
//! - Flows reference existing nodes and stay inside one scope
//! - Every scope has exactly one start event
//! - Default flows leave their own node
//! - Guard expressions parse
//!
//! Unreachable nodes and dead ends are only warned about.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use thiserror::Error;

use super::condition::Condition;
use super::model::{NodeKind, ProcessDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Process has no id")]
    EmptyProcessId,

    #[error("Process '{0}' has no nodes")]
    EmptyProcess(String),

    #[error("Node has empty or whitespace-only ID")]
    EmptyNodeId,

    #[error("Duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("Duplicate flow ID: '{0}'")]
    DuplicateFlowId(String),

    #[error("Flow '{flow}' references unknown node '{node}'")]
    UnknownFlowNode { flow: String, node: String },

    #[error("Flow '{0}' crosses a sub-process boundary")]
    FlowCrossesScope(String),

    #[error("Node '{node}' is placed in unknown sub-process '{parent}'")]
    UnknownParent { node: String, parent: String },

    #[error("Node '{node}' is placed in '{parent}', which is not a sub-process")]
    ParentNotSubProcess { node: String, parent: String },

    #[error("Scope '{0}' has no start event")]
    MissingStartEvent(String),

    #[error("Scope '{0}' has more than one start event")]
    MultipleStartEvents(String),

    #[error("Start event '{0}' has incoming flows")]
    StartEventWithIncoming(String),

    #[error("Node '{node}' names default flow '{flow}', which does not leave it")]
    InvalidDefaultFlow { node: String, flow: String },

    #[error("Service task '{0}' has no handler")]
    MissingHandler(String),

    #[error("Flow '{flow}' has an invalid condition: {message}")]
    InvalidCondition { flow: String, message: String },
}

const TOP_LEVEL: &str = "<process>";

fn scope_name(scope: Option<&str>) -> String {
    scope.unwrap_or(TOP_LEVEL).to_string()
}

/// Validates a process graph, collecting every error found.
pub fn validate_process(process: &ProcessDefinition) -> Result<(), Vec<ValidationError>> {
    info!(
        "Validating process '{}' with {} nodes and {} flows",
        process.id,
        process.nodes.len(),
        process.flows.len()
    );

    let mut errors = Vec::new();

    if process.id.trim().is_empty() {
        errors.push(ValidationError::EmptyProcessId);
    }
    if process.nodes.is_empty() {
        errors.push(ValidationError::EmptyProcess(process.id.clone()));
        return Err(errors);
    }

    // Node ids
    let mut parents: HashMap<&str, Option<&str>> = HashMap::new();
    for node in &process.nodes {
        if node.id.trim().is_empty() {
            errors.push(ValidationError::EmptyNodeId);
            continue;
        }
        if parents.insert(&node.id, node.parent.as_deref()).is_some() {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
        if let NodeKind::ServiceTask { handler } = &node.kind {
            if handler.trim().is_empty() {
                errors.push(ValidationError::MissingHandler(node.id.clone()));
            }
        }
    }

    // Sub-process placement
    for node in &process.nodes {
        let Some(parent) = node.parent.as_deref() else {
            continue;
        };
        match process.get_node(parent) {
            None => errors.push(ValidationError::UnknownParent {
                node: node.id.clone(),
                parent: parent.to_string(),
            }),
            Some(p) if p.kind != NodeKind::SubProcess => errors.push(ValidationError::ParentNotSubProcess {
                node: node.id.clone(),
                parent: parent.to_string(),
            }),
            Some(_) => {}
        }
    }

    // Flows
    let mut flow_ids = HashSet::new();
    for flow in &process.flows {
        if !flow_ids.insert(flow.id.as_str()) {
            errors.push(ValidationError::DuplicateFlowId(flow.id.clone()));
        }

        let mut endpoints_known = true;
        for endpoint in [&flow.source, &flow.target] {
            if !parents.contains_key(endpoint.as_str()) {
                errors.push(ValidationError::UnknownFlowNode {
                    flow: flow.id.clone(),
                    node: endpoint.clone(),
                });
                endpoints_known = false;
            }
        }
        if endpoints_known && parents.get(flow.source.as_str()) != parents.get(flow.target.as_str()) {
            errors.push(ValidationError::FlowCrossesScope(flow.id.clone()));
        }

        if let Some(condition) = &flow.condition {
            if let Err(e) = Condition::parse(condition) {
                errors.push(ValidationError::InvalidCondition {
                    flow: flow.id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    // Start events per scope
    let mut scopes: Vec<Option<&str>> = vec![None];
    scopes.extend(
        process
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::SubProcess)
            .map(|n| Some(n.id.as_str())),
    );
    for scope in scopes {
        match process.start_events(scope).len() {
            0 => errors.push(ValidationError::MissingStartEvent(scope_name(scope))),
            1 => {}
            _ => errors.push(ValidationError::MultipleStartEvents(scope_name(scope))),
        }
    }

    for node in &process.nodes {
        if node.kind == NodeKind::StartEvent && !process.incoming(&node.id).is_empty() {
            errors.push(ValidationError::StartEventWithIncoming(node.id.clone()));
        }

        if let Some(default_flow) = &node.default_flow {
            let leaves_node = process
                .get_flow(default_flow)
                .map_or(false, |f| f.source == node.id);
            if !leaves_node {
                errors.push(ValidationError::InvalidDefaultFlow {
                    node: node.id.clone(),
                    flow: default_flow.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        warn_unreachable(process);
        debug!("Process '{}' is valid", process.id);
        Ok(())
    } else {
        Err(errors)
    }
}

/// Logs nodes that no start event can reach and gateways without exits.
fn warn_unreachable(process: &ProcessDefinition) {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = process
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::StartEvent)
        .map(|n| n.id.as_str())
        .collect();

    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        for flow in process.outgoing(id) {
            queue.push_back(flow.target.as_str());
        }
    }

    for node in &process.nodes {
        if !reached.contains(node.id.as_str()) {
            warn!("Process '{}': node '{}' is unreachable", process.id, node.id);
        }
        if node.kind.is_gateway() && process.outgoing(&node.id).is_empty() {
            warn!(
                "Process '{}': gateway '{}' has no outgoing flows",
                process.id, node.id
            );
        }
    }
}

/// Joins validation errors into one message.
pub fn describe_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::model::FlowNode;

    fn valid() -> ProcessDefinition {
        ProcessDefinition::new("p")
            .node(FlowNode::new("start", NodeKind::StartEvent))
            .node(FlowNode::new("task", NodeKind::UserTask))
            .node(FlowNode::new("end", NodeKind::EndEvent { terminate: false }))
            .flow("f1", "start", "task")
            .flow("f2", "task", "end")
    }

    #[test]
    fn test_valid_process() {
        assert!(validate_process(&valid()).is_ok());
    }

    #[test]
    fn test_empty_process() {
        let errors = validate_process(&ProcessDefinition::new("p")).unwrap_err();
        assert_eq!(errors, vec![ValidationError::EmptyProcess("p".to_string())]);
    }

    #[test]
    fn test_duplicate_ids() {
        let process = valid()
            .node(FlowNode::new("task", NodeKind::ManualTask))
            .flow("f1", "task", "end");
        let errors = validate_process(&process).unwrap_err();

        assert!(errors.contains(&ValidationError::DuplicateNodeId("task".to_string())));
        assert!(errors.contains(&ValidationError::DuplicateFlowId("f1".to_string())));
    }

    #[test]
    fn test_unknown_flow_target() {
        let process = valid().flow("f3", "task", "nowhere");
        let errors = validate_process(&process).unwrap_err();

        assert_eq!(
            errors,
            vec![ValidationError::UnknownFlowNode {
                flow: "f3".to_string(),
                node: "nowhere".to_string()
            }]
        );
    }

    #[test]
    fn test_missing_and_multiple_start_events() {
        let mut process = valid();
        process.nodes.remove(0);
        process.flows.remove(0);
        let errors = validate_process(&process).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingStartEvent("<process>".to_string())));

        let process = valid().node(FlowNode::new("start2", NodeKind::StartEvent));
        let errors = validate_process(&process).unwrap_err();
        assert!(errors.contains(&ValidationError::MultipleStartEvents("<process>".to_string())));
    }

    #[test]
    fn test_sub_process_rules() {
        let process = valid()
            .node(FlowNode::new("sub", NodeKind::SubProcess))
            .node(FlowNode::new("inner", NodeKind::UserTask).within("sub"))
            .node(FlowNode::new("stray", NodeKind::UserTask).within("task"))
            .flow("f3", "inner", "end");
        let errors = validate_process(&process).unwrap_err();

        assert!(errors.contains(&ValidationError::MissingStartEvent("sub".to_string())));
        assert!(errors.contains(&ValidationError::FlowCrossesScope("f3".to_string())));
        assert!(errors.contains(&ValidationError::ParentNotSubProcess {
            node: "stray".to_string(),
            parent: "task".to_string()
        }));
    }

    #[test]
    fn test_invalid_default_flow_and_condition() {
        let mut process = valid().guarded_flow("f3", "task", "end", "x >");
        process.nodes[1].default_flow = Some("f1".to_string());
        let errors = validate_process(&process).unwrap_err();

        assert!(errors.contains(&ValidationError::InvalidDefaultFlow {
            node: "task".to_string(),
            flow: "f1".to_string()
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidCondition { flow, .. } if flow == "f3")));
    }

    #[test]
    fn test_missing_service_handler() {
        let process = valid().node(FlowNode::new(
            "svc",
            NodeKind::ServiceTask {
                handler: " ".to_string(),
            },
        ));
        let errors = validate_process(&process).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingHandler("svc".to_string())));
    }

    #[test]
    fn test_describe_errors() {
        let message = describe_errors(&[
            ValidationError::EmptyNodeId,
            ValidationError::DuplicateNodeId("a".to_string()),
        ]);
        assert_eq!(
            message,
            "Node has empty or whitespace-only ID; Duplicate node ID: 'a'"
        );
    }
}

//! Process Parser
//!
//! Loads process graphs from YAML files and validates them before they are
//! handed to the engine.

use std::error::Error;
use std::fs;

use log::{debug, info};

use super::model::ProcessDefinition;
use super::validator::{describe_errors, validate_process};

/// Loads a process definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use procrunner::process::load_process;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let process = load_process("order.yaml")?;
///     println!("Loaded {} nodes", process.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_process(path: &str) -> Result<ProcessDefinition, Box<dyn Error>> {
    info!("Loading process from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read process file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_process(&yaml_content)
}

/// Parses and validates a process definition from YAML text.
pub fn parse_process(yaml_content: &str) -> Result<ProcessDefinition, Box<dyn Error>> {
    let mut process: ProcessDefinition = serde_yaml::from_str(yaml_content)
        .map_err(|e| format!("Failed to parse process YAML: {}. Check the file format.", e))?;

    for node in &mut process.nodes {
        node.id = node.id.trim().to_string();
    }

    validate_process(&process).map_err(|errors| {
        format!(
            "Process '{}' is invalid: {}",
            process.id,
            describe_errors(&errors)
        )
    })?;

    info!(
        "Loaded process '{}' (version {}): {} nodes, {} flows",
        process.id,
        process.version,
        process.nodes.len(),
        process.flows.len()
    );
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::model::NodeKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ORDER: &str = r#"
id: order
name: Order handling
nodes:
  - id: start
    type: start_event
  - id: check
    type: exclusive_gateway
    default_flow: to_manual
  - id: approve
    type: service_task
    handler: approve
  - id: manual
    type: user_task
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: check }
  - { id: to_auto, source: check, target: approve, condition: "amount <= 100" }
  - { id: to_manual, source: check, target: manual }
  - { id: f4, source: approve, target: end }
  - { id: f5, source: manual, target: end }
"#;

    #[test]
    fn test_load_process_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", ORDER).unwrap();

        let process = load_process(file.path().to_str().unwrap()).unwrap();

        assert_eq!(process.id, "order");
        assert_eq!(process.nodes.len(), 5);
        assert_eq!(
            process.get_node("approve").unwrap().kind,
            NodeKind::ServiceTask {
                handler: "approve".to_string()
            }
        );
    }

    #[test]
    fn test_missing_file() {
        let err = load_process("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read process file"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = parse_process("id: [unclosed").unwrap_err();
        assert!(err.to_string().contains("Failed to parse process YAML"));
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    type: start_event
flows:
  - { id: f1, source: start, target: ghost }
"#;
        let err = parse_process(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_demo_process_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/order.yaml");
        let process = load_process(path).unwrap();

        assert_eq!(process.id, "order");
        assert!(process.get_node("charge_card").unwrap().async_before);
        assert_eq!(process.outgoing("fork").len(), 2);
    }
}

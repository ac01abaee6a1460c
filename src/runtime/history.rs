//! Historic records written after each successful commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::variables::VariableValue;

/// Lifetime of one process instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoricProcessInstance {
    pub id: String,
    pub process_definition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// One visit of an execution to a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoricActivityInstance {
    pub process_instance_id: String,
    pub execution_id: String,
    pub activity_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Immutable record of a variable change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoricVariableUpdate {
    pub process_instance_id: String,
    pub scope_id: String,
    pub variable_id: String,
    pub name: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<VariableValue>,
    pub new_value: VariableValue,
    pub time: DateTime<Utc>,
}

/// History produced by a command, flushed after its commit.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    ProcessStarted {
        process_instance_id: String,
        process_definition_id: String,
        business_key: Option<String>,
        time: DateTime<Utc>,
    },
    ProcessEnded {
        process_instance_id: String,
        reason: String,
        deleted: bool,
        time: DateTime<Utc>,
    },
    ActivityStarted {
        process_instance_id: String,
        execution_id: String,
        activity_id: String,
        time: DateTime<Utc>,
    },
    ActivityEnded {
        process_instance_id: String,
        execution_id: String,
        activity_id: String,
        time: DateTime<Utc>,
    },
    VariableUpdated(HistoricVariableUpdate),
}

//! Process definitions: the graph model, its YAML loader, structural
//! validation and the guard expression language.

pub mod condition;
pub mod model;
pub mod parser;
pub mod validator;

pub use condition::{Condition, ExpressionError};
pub use model::{FlowNode, NodeKind, ProcessDefinition, SequenceFlow};
pub use parser::{load_process, parse_process};
pub use validator::{validate_process, ValidationError};

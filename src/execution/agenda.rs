//! Agenda
//!
//! The FIFO queue of pending interpreter operations for one command.
//! Operations only ever append follow-ups; nothing is reordered.

use std::collections::VecDeque;

use crate::runtime::ExecutionRef;

/// One unit of interpreter work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Enter the node the execution points at
    ContinueProcess { target: ExecutionRef, skip_async: bool },
    /// Leave the current node via its outgoing flows
    TakeOutgoingFlows { target: ExecutionRef, skip_async: bool },
    /// Resume an execution waiting in a node
    TriggerExecution { target: ExecutionRef },
    /// Re-evaluate inactive executions of recently touched instances
    ExecuteInactiveBehaviors,
}

impl Operation {
    pub fn target(&self) -> Option<&ExecutionRef> {
        match self {
            Self::ContinueProcess { target, .. }
            | Self::TakeOutgoingFlows { target, .. }
            | Self::TriggerExecution { target } => Some(target),
            Self::ExecuteInactiveBehaviors => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ContinueProcess { .. } => "continue-process",
            Self::TakeOutgoingFlows { .. } => "take-outgoing-flows",
            Self::TriggerExecution { .. } => "trigger-execution",
            Self::ExecuteInactiveBehaviors => "execute-inactive-behaviors",
        }
    }
}

/// Pending operations of the current command.
#[derive(Debug, Default)]
pub struct Agenda {
    queue: VecDeque<Operation>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.queue.push_back(operation);
    }

    pub fn pop(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut agenda = Agenda::new();
        let a = ExecutionRef::new("1", "1");
        let b = ExecutionRef::new("1", "2");

        agenda.push(Operation::ContinueProcess {
            target: a.clone(),
            skip_async: false,
        });
        agenda.push(Operation::TriggerExecution { target: b.clone() });
        agenda.push(Operation::ExecuteInactiveBehaviors);

        assert_eq!(agenda.len(), 3);
        assert_eq!(agenda.pop().unwrap().target(), Some(&a));
        assert_eq!(agenda.pop().unwrap().target(), Some(&b));
        assert_eq!(agenda.pop().unwrap().name(), "execute-inactive-behaviors");
        assert!(agenda.pop().is_none());
        assert!(agenda.is_empty());
    }
}

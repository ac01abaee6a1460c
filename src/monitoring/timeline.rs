//! Execution Timeline
//!
//! Tracks when executions enter and leave nodes, for run reports and Gantt
//! charts. [`TimelineListener`] feeds a shared timeline from engine events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::execution::{EngineEvent, EventPhase, ExecutionListener, ListenerError};

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    /// Execution entered the node
    Entered,
    /// Execution left the node over a sequence flow or completed in it
    Completed,
    /// Execution was removed while in the node (terminate, delete, join)
    Cancelled,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub activity_id: String,
    pub execution_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks node visits of process executions.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    /// Node each execution currently sits in
    open: HashMap<String, String>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            open: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an execution entering a node, closing its previous visit.
    pub fn enter(&mut self, execution_id: &str, activity_id: &str) {
        self.leave(execution_id, EventType::Completed);
        self.open.insert(execution_id.to_string(), activity_id.to_string());
        self.push(execution_id, activity_id, EventType::Entered);
    }

    /// Closes the open visit of an execution, if any.
    pub fn leave(&mut self, execution_id: &str, event_type: EventType) {
        if let Some(activity_id) = self.open.remove(execution_id) {
            self.push(execution_id, &activity_id, event_type);
        }
    }

    fn push(&mut self, execution_id: &str, activity_id: &str, event_type: EventType) {
        self.events.push(TimelineEvent {
            activity_id: activity_id.to_string(),
            execution_id: execution_id.to_string(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Applies one engine event.
    pub fn record(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::NodeEntered {
                execution_id, node_id, ..
            } => self.enter(execution_id, node_id),
            EngineEvent::FlowTaken {
                execution_id, source_id, ..
            } => {
                if self.open.get(execution_id) == Some(source_id) {
                    self.leave(execution_id, EventType::Completed);
                }
            }
            EngineEvent::ExecutionEnded {
                execution_id, reason, ..
            } => {
                let event_type = if reason == "completed" {
                    EventType::Completed
                } else {
                    EventType::Cancelled
                };
                self.leave(execution_id, event_type);
            }
            EngineEvent::Transaction { .. } => {}
        }
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Executions still sitting in a node, with that node.
    pub fn open_activities(&self) -> Vec<(String, String)> {
        let mut open: Vec<(String, String)> = self
            .open
            .iter()
            .map(|(execution, activity)| (execution.clone(), activity.clone()))
            .collect();
        open.sort();
        open
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Start and end offsets (ms) of every closed visit, in start order.
    fn visits(&self) -> Vec<(String, u128, u128)> {
        let mut entered: HashMap<&str, (&str, u128)> = HashMap::new();
        let mut visits = Vec::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Entered => {
                    entered.insert(&event.execution_id, (&event.activity_id, elapsed));
                }
                EventType::Completed | EventType::Cancelled => {
                    if let Some((activity, start)) = entered.remove(event.execution_id.as_str()) {
                        visits.push((activity.to_string(), start, elapsed));
                    }
                }
            }
        }

        visits.sort_by_key(|(_, start, _)| *start);
        visits
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each node visit is shown as a bar indicating when it ran relative to
    /// the total run time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (activity_id, start, end) in self.visits() {
            let start_pos = (start as f64 * scale) as usize;
            let duration = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(duration));

            output.push_str(&format!(
                "{:12} |{}| ({} ms)\n",
                truncate(&activity_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Time spent per node in milliseconds, summed over visits.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut durations: HashMap<String, u128> = HashMap::new();
        for (activity_id, start, end) in self.visits() {
            *durations.entry(activity_id).or_insert(0) += end - start;
        }
        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// Feeds engine events into a shared [`ExecutionTimeline`].
#[derive(Debug, Clone, Default)]
pub struct TimelineListener {
    timeline: Arc<Mutex<ExecutionTimeline>>,
}

impl TimelineListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the timeline recorded so far.
    pub fn snapshot(&self) -> ExecutionTimeline {
        self.timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExecutionListener for TimelineListener {
    fn notify(&self, phase: EventPhase, event: &EngineEvent) -> Result<(), ListenerError> {
        let relevant = match event {
            EngineEvent::NodeEntered { .. } | EngineEvent::FlowTaken { .. } => phase == EventPhase::Before,
            EngineEvent::ExecutionEnded { .. } => phase == EventPhase::After,
            EngineEvent::Transaction { .. } => false,
        };
        if relevant {
            self.timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ProcessEngine;
    use crate::process::{FlowNode, NodeKind, ProcessDefinition};
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;

    fn entered(execution: &str, node: &str) -> EngineEvent {
        EngineEvent::NodeEntered {
            process_instance_id: "1".to_string(),
            execution_id: execution.to_string(),
            node_id: node.to_string(),
        }
    }

    fn ended(execution: &str, reason: &str) -> EngineEvent {
        EngineEvent::ExecutionEnded {
            process_instance_id: "1".to_string(),
            execution_id: execution.to_string(),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.get_events().is_empty());
        assert!(timeline.open_activities().is_empty());
    }

    #[test]
    fn test_enter_closes_previous_visit() {
        let mut timeline = ExecutionTimeline::new();
        timeline.enter("1", "a");
        timeline.enter("1", "b");

        let events = timeline.get_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].activity_id, "a");
        assert_eq!(events[1].event_type, EventType::Completed);
        assert_eq!(timeline.open_activities(), vec![("1".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record(&entered("1", "review"));
        thread::sleep(Duration::from_millis(50));
        timeline.record(&ended("1", "completed"));

        let durations = timeline.get_durations();
        assert!(*durations.get("review").unwrap() >= 50);
    }

    #[test]
    fn test_terminated_execution_is_cancelled() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record(&entered("4", "wait"));
        timeline.record(&ended("4", "terminated"));

        assert_eq!(timeline.get_events()[1].event_type, EventType::Cancelled);
        assert!(timeline.open_activities().is_empty());
    }

    #[test]
    fn test_flow_from_other_node_keeps_visit_open() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record(&entered("2", "a"));
        timeline.record(&EngineEvent::FlowTaken {
            process_instance_id: "1".to_string(),
            execution_id: "2".to_string(),
            flow_id: "f".to_string(),
            source_id: "fork".to_string(),
            target_id: "b".to_string(),
        });

        assert_eq!(timeline.open_activities().len(), 1);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.enter("1", "step1");
        thread::sleep(Duration::from_millis(20));
        timeline.enter("1", "step2");
        thread::sleep(Duration::from_millis(20));
        timeline.leave("1", EventType::Completed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate_long_names() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a_very_long_activity", 8), "a_ver...");
    }

    #[test]
    fn test_listener_follows_process() {
        let engine = ProcessEngine::default();
        let listener = TimelineListener::new();
        engine.add_listener(Arc::new(listener.clone()));
        engine
            .deploy(
                ProcessDefinition::new("p")
                    .node(FlowNode::new("start", NodeKind::StartEvent))
                    .node(FlowNode::new("review", NodeKind::UserTask))
                    .node(FlowNode::new("end", NodeKind::EndEvent { terminate: false }))
                    .flow("f1", "start", "review")
                    .flow("f2", "review", "end"),
            )
            .unwrap();

        let pi = engine.start_process("p", BTreeMap::new()).unwrap();
        assert_eq!(listener.snapshot().open_activities(), vec![(pi.clone(), "review".to_string())]);

        engine.trigger_execution(&pi, BTreeMap::new()).unwrap();
        let timeline = listener.snapshot();
        assert!(timeline.open_activities().is_empty());
        assert!(timeline.get_durations().contains_key("review"));
    }
}

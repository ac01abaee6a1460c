//! Monitoring Module
//!
//! Observes running process instances.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node enter/leave timing for Gantt charts
//! - [`TimelineListener`]: Engine listener that feeds a timeline

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent, TimelineListener};

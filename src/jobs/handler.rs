//! Custom job handlers, keyed by handler type.

use crate::execution::{CommandContext, HandlerResult};

use super::model::Job;

/// Code run when a message job of a registered type executes.
///
/// The handler runs inside the job's command; everything it changes through
/// the context commits or rolls back with the job.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &Job, ctx: &mut CommandContext) -> HandlerResult;
}

/// Adapts a closure to [`JobHandler`].
pub struct FnJobHandler<F>(pub F);

impl<F> JobHandler for FnJobHandler<F>
where
    F: Fn(&Job, &mut CommandContext) -> HandlerResult + Send + Sync,
{
    fn execute(&self, job: &Job, ctx: &mut CommandContext) -> HandlerResult {
        (self.0)(job, ctx)
    }
}

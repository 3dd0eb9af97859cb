//! Durable lifecycle work items and the dispatcher that executes them.

mod dispatcher;
mod queue;

pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use queue::{NewTask, TaskQueue};

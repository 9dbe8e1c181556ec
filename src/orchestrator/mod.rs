//! The orchestrator: one dispatch thread, a task queue feeding it and the
//! application handlers it runs

mod alert;
mod app;
mod queue;

pub use alert::{dismiss_alert, show_alert};
pub use app::{AppOptions, Application, DeviceStatus, MediaBackend};
pub use queue::{Scheduler, Task, TaskQueue};

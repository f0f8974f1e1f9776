//! Task broker for Sockmux
//!
//! Multiplexes client connections over one shared, authenticated transport
//! to a remote relay peer. Each client connection that resolves its target
//! through the remote gets its own [`Task`], identified by a task id carried
//! in every frame.

mod registry;
mod session;
mod task;

pub use registry::{TaskEvent, TaskRegistry};
pub use session::TaskBroker;
pub use task::{Task, TaskReceiver, TaskSender};

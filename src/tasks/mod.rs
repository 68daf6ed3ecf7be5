//! Task lifecycle: creation, dispatch, callback ingestion and the HTTP surface.

pub mod callback;
pub mod chunks;
pub mod dispatch;
pub mod emitter;
pub mod model;
pub mod routes;
pub mod service;
pub mod status;

pub use model::{NewTask, Task, TaskCallback};
pub use status::TaskStatus;

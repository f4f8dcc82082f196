//! Domain types and pure rules for the task broker.
//!
//! This crate has no opinion on storage: `broker-store` persists
//! [`model::StoredTask`]/[`model::TaskEvent`] against Postgres, and
//! `broker-http` translates [`error::BrokerError`] into HTTP responses.

pub mod cursor;
pub mod derive;
pub mod error;
pub mod events;
pub mod model;
pub mod validate;

pub use cursor::StreamCursor;
pub use error::{BrokerError, Result};
pub use model::{
    CreateTaskInput, IndexSnapshot, PlanStep, PlanStepStatus, StoredTask, Task, TaskEvent,
    TaskSnapshot, TaskStatus,
};

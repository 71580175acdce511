//! Durable asynchronous task pipeline
//!
//! Requests become [`Task`](kaas_common::model::Task) rows via the
//! [`TaskQueue`]; the [`TaskEngine`] worker pool claims them, dispatches to
//! the [`TaskHandler`] registered for their kind and records the outcome with
//! retry bookkeeping.

pub mod engine;
pub mod handler;
pub mod queue;
pub mod webhook;

pub use engine::{Disposition, EngineConfig, TaskEngine, TaskReport};
pub use handler::{HandlerRegistry, Outcome, TaskHandler};
pub use queue::TaskQueue;
pub use webhook::{HttpForwardApplier, WebhookApplier, WebhookHandler};

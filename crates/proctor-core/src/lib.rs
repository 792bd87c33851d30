//! proctor-core: the agent runtime and coordination plane.
//!
//! A durable priority message bus with retry/DLQ/idempotency/auditing, a
//! shared-state store, a broadcast event channel, an agent runtime with
//! health checks and circuit breaking, a priority-aware consumer/router,
//! and the seven agents that drive the browser-test lifecycle.

pub mod agents;
pub mod bus;
pub mod config;
pub mod db;
pub mod events;
pub mod generator;
pub mod message;
pub mod router;
pub mod runner;
pub mod runtime;
pub mod selector;
pub mod state;

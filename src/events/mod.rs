//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the supervisor, the signal
//! router, the reaper and the per-program actors.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Supervisor`, `ProgramActor`, `SignalRouter`, `Reaper`.
//! - **Consumers**: the `Supervisor` control loop (shutdown/kill requests) and
//!   integration tests asserting lifecycle ordering.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};

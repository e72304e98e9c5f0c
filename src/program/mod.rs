//! Per-program lifecycle: state machine and actor.
//!
//! Each configured program is driven by one [`ProgramActor`] task that owns
//! the child process, its two log pumps and the program's state cell. The
//! supervisor observes state through a watch channel and requests stops
//! through cancellation tokens; it never touches the child directly.
//!
//! ## Contents
//! - [`ProgramState`] the lifecycle states and transition rules
//! - [`StateCell`] the observable state holder (watch + event bus + DEBUG log)
//! - [`ProgramSpec`] the resolved, immutable description of one program
//! - [`ProgramActor`], [`ProgramHandle`] the runtime side

mod actor;
mod state;

pub use actor::{ProgramActor, ProgramHandle, ProgramSpec};
pub use state::{wait_state, ProgramState, StateCell};

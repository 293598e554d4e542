//! Per-generation chat state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.
//! [`ChatMachine`] wraps the pure function and notifies subscribers.

mod effect;
pub mod event;
mod machine;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::ChatEvent;
pub use machine::{ChatMachine, Subscriber};
pub use state::ChatState;
pub use transition::{transition, TransitionResult};

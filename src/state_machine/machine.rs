//! Stateful wrapper around the pure transition function

use super::{transition, ChatEvent, ChatState, Effect};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// State observer; errors are logged and never block the update
pub type Subscriber = Box<dyn Fn(&ChatState) -> Result<(), String> + Send + Sync>;

/// Chat state machine holding the current state and its observers
#[derive(Default)]
pub struct ChatMachine {
    state: ChatState,
    subscribers: Vec<Subscriber>,
}

impl ChatMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    /// Apply an event.
    ///
    /// Returns the effects of the transition, or `None` if the event was
    /// ignored. The state is updated before any subscriber runs.
    pub fn dispatch(&mut self, event: ChatEvent) -> Option<Vec<Effect>> {
        let kind = event.kind();
        let Some(result) = transition(&self.state, event) else {
            tracing::debug!(state = self.state.as_str(), event = kind, "Ignored event");
            return None;
        };

        tracing::debug!(
            from = self.state.as_str(),
            to = result.new_state.as_str(),
            event = kind,
            "State transition"
        );
        self.state = result.new_state;
        self.notify();
        Some(result.effects)
    }

    fn notify(&self) {
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| subscriber(&self.state))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(subscriber = index, error = %e, "State subscriber failed");
                }
                Err(_) => {
                    tracing::error!(subscriber = index, "State subscriber panicked");
                }
            }
        }
    }
}

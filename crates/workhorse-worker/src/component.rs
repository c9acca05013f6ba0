//! Shared component lifecycle state.

use tokio::sync::watch;

/// Lifecycle of a runtime component (listener, provider, executor, worker).
///
/// `Pending → Started → {Stopped | Crashed | Killed}`; no other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Pending,
    Started,
    Stopped,
    Crashed,
    Killed,
}

impl RuntimeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeState::Stopped | RuntimeState::Crashed | RuntimeState::Killed
        )
    }
}

/// A watchable state holder; `join` blocks until a terminal state.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<RuntimeState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RuntimeState::Pending);
        Self { tx }
    }

    pub fn get(&self) -> RuntimeState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: RuntimeState) {
        self.tx.send_replace(state);
    }

    /// Transition only if currently in `from`; returns whether it applied.
    pub fn transition(&self, from: RuntimeState, to: RuntimeState) -> bool {
        let mut applied = false;
        self.tx.send_modify(|state| {
            if *state == from {
                *state = to;
                applied = true;
            }
        });
        applied
    }

    pub fn is_started(&self) -> bool {
        self.get() == RuntimeState::Started
    }

    /// Wait until the component reaches a terminal state.
    pub async fn join(&self) {
        let mut rx = self.tx.subscribe();
        // Closed sender means the component is gone, which is terminal enough.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }
}

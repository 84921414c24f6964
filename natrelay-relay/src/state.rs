use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Relay lifecycle. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Pending,
    Opening,
    Opened,
    Closing,
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayState::Pending => "pending",
            RelayState::Opening => "opening",
            RelayState::Opened => "opened",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Observable lifecycle plus the flags that gate traffic.
pub struct Lifecycle {
    state: watch::Sender<RelayState>,
    recovering: AtomicBool,
    shutting_down: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RelayState::Pending);
        Self {
            state,
            recovering: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Moves to `to` if that is forward of the current state.
    pub fn advance(&self, to: RelayState) -> bool {
        let mut moved = None;
        self.state.send_if_modified(|current| {
            if to > *current {
                moved = Some(*current);
                *current = to;
                true
            } else {
                false
            }
        });
        if let Some(from) = moved {
            log::debug!("relay state {} -> {}", from, to);
        }
        moved.is_some()
    }

    /// Moves `from` -> `to` only if the relay is currently in `from`.
    pub fn advance_from(&self, from: RelayState, to: RelayState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|current| {
            if *current == from && to > from {
                *current = to;
                moved = true;
            }
            moved
        });
        moved
    }

    /// Open and not mid-recovery: the only condition under which traffic flows.
    pub fn is_open(&self) -> bool {
        self.state() == RelayState::Opened
            && !self.recovering.load(Ordering::Acquire)
            && !self.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Returns true for exactly one caller.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    /// Resolves once the state is at least `target`.
    pub async fn reached(&self, target: RelayState) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow_and_update() >= target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

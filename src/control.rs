//! Cooperative control signals for a running operation.
//!
//! A single `watch` channel carries the requested state. Workers read it at
//! loop boundaries; the latest value wins.

use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
}

/// Sending side, held by the operation handle.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: watch::Sender<Control>,
}

/// Receiving side, owned by the worker task.
#[derive(Debug, Clone)]
pub struct ControlSignal {
    rx: watch::Receiver<Control>,
}

pub fn control_channel() -> (ControlHandle, ControlSignal) {
    let (tx, rx) = watch::channel(Control::Run);
    (ControlHandle { tx }, ControlSignal { rx })
}

impl ControlHandle {
    pub fn pause(&self) {
        self.tx.send_if_modified(|c| {
            if *c == Control::Run {
                *c = Control::Pause;
                true
            } else {
                false
            }
        });
    }

    /// No effect once cancelled.
    pub fn resume(&self) {
        self.tx.send_if_modified(|c| {
            if *c == Control::Pause {
                *c = Control::Run;
                true
            } else {
                false
            }
        });
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_if_modified(|c| {
            if *c == Control::Cancel {
                false
            } else {
                *c = Control::Cancel;
                true
            }
        });
    }

    pub fn state(&self) -> Control {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == Control::Cancel
    }

    pub fn is_paused(&self) -> bool {
        self.state() == Control::Pause
    }
}

impl ControlSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() == Control::Cancel
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow() == Control::Pause
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c == Control::Cancel).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Block while paused, re-checking every `poll`. Returns `false` if the
    /// operation was cancelled during (or before) the wait.
    pub async fn wait_while_paused(&self, poll: Duration) -> bool {
        loop {
            let state = *self.rx.borrow();
            match state {
                Control::Run => return true,
                Control::Cancel => return false,
                Control::Pause => {}
            }
            tokio::time::sleep(poll).await;
        }
    }
}

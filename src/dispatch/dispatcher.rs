//! Command dispatcher: turns command messages into device and store work.
//!
//! # Invocation lifecycle
//!
//! ```text
//! Idle ──► Dispatched ──┬──► Recording ──┐
//!                       └──► Replaying ──┴──► Idle
//! ```
//!
//! Commands are consumed from a single channel and processed to completion
//! one at a time. The device lock is held for a whole record or replay, so
//! the temperature poller can never interleave with a learning session.

use super::command::{Action, CommandMessage};
use crate::device::{DeviceError, IrDevice, SharedDevice};
use crate::persistence::{SignalStore, StoreError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Bounded polling used while the device is in learning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnSettings {
    /// Delay before each check for a captured signal
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for LearnSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 6,
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Replayed { bytes: usize },
    Recorded { bytes: usize, attempt: u32 },
    NothingCaptured { attempts: u32 },
    Ignored,
}

pub struct CommandDispatcher {
    store: SignalStore,
    device: SharedDevice,
    learning: LearnSettings,
}

impl CommandDispatcher {
    pub fn new(store: SignalStore, device: SharedDevice, learning: LearnSettings) -> Self {
        Self {
            store,
            device,
            learning,
        }
    }

    /// Consumes commands in delivery order until the channel closes or
    /// shutdown is requested. An interrupted recording stores nothing.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<CommandMessage>,
        shutdown: CancellationToken,
    ) {
        info!("Command dispatcher started");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = commands.recv() => message,
            };
            let Some(message) = message else {
                info!("Command channel closed");
                break;
            };

            let name = message.name.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("Shutdown while handling command '{}'", name);
                    break;
                }
                _ = self.handle(message) => {}
            }
        }

        info!("Command dispatcher stopped");
    }

    /// Dispatches one message. Failures are logged and go no further.
    pub async fn handle(&self, message: CommandMessage) {
        let action = message.action();
        debug!(
            "Received command '{}' with payload '{}'",
            message.name, message.payload
        );

        match self.dispatch(&message.name, action.clone()).await {
            Ok(DispatchOutcome::Ignored) => {
                debug!("Unrecognized payload '{}' for '{}'", message.payload, message.name);
            }
            Ok(outcome) => debug!("Command '{}' finished: {:?}", message.name, outcome),
            Err(e) => error!("Command '{}' ({}) failed: {}", message.name, action, e),
        }
    }

    pub async fn dispatch(&self, name: &str, action: Action) -> Result<DispatchOutcome, DispatchError> {
        if let Action::Unrecognized(_) = action {
            return Ok(DispatchOutcome::Ignored);
        }
        self.store.path_for(name)?;

        let mut guard = self.device.lock().await;
        let device: &mut dyn IrDevice = &mut **guard;

        match action {
            Action::Replay => self.replay(device, name).await,
            Action::Record => self.record(device, name).await,
            Action::AutoRecordOrReplay => {
                if self.store.exists(name).await {
                    self.replay(device, name).await
                } else {
                    self.record(device, name).await
                }
            }
            Action::Unrecognized(_) => Ok(DispatchOutcome::Ignored),
        }
    }

    async fn replay(
        &self,
        device: &mut dyn IrDevice,
        name: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let signal = self.store.load(name).await?;
        info!("Replaying command '{}' ({} bytes)", name, signal.len());

        device.send(&signal).await?;
        Ok(DispatchOutcome::Replayed {
            bytes: signal.len(),
        })
    }

    async fn record(
        &self,
        device: &mut dyn IrDevice,
        name: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        info!(
            "Recording command '{}', waiting up to {:?} for a signal",
            name,
            self.learning.poll_interval.saturating_mul(self.learning.max_attempts)
        );
        device.enter_learning().await?;

        for attempt in 1..=self.learning.max_attempts {
            tokio::time::sleep(self.learning.poll_interval).await;

            if let Some(signal) = device.poll_captured_signal().await? {
                debug!("Captured signal for '{}' on attempt {}", name, attempt);
                self.store.save(name, &signal).await?;
                return Ok(DispatchOutcome::Recorded {
                    bytes: signal.len(),
                    attempt,
                });
            }
        }

        warn!("No command received for '{}'", name);
        Ok(DispatchOutcome::NothingCaptured {
            attempts: self.learning.max_attempts,
        })
    }
}

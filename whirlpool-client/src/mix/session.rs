//! Contract with the external mix session runner
//!
//! The runner executes one CoinJoin round per UTXO out of band. It reports
//! back through the [`MixListener`] it was handed, from any thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::debug;

use super::scheduler::Command;
use super::SchedulerError;
use crate::types::WhirlpoolUtxo;

/// Steps of a mix round, as reported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixStep {
    Connecting,
    Connected,
    RegisteredInput,
    ConfirmingInput,
    ConfirmedInput,
    RegisteringOutput,
    RegisteredOutput,
    Signing,
    Signed,
    RevealedOutput,
    Success,
    Fail,
}

/// Final result of a mix session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixOutcome {
    Success,
    Failed,
}

/// Starts mix sessions; owned by the embedding wallet
pub trait MixSessionRunner: Send + Sync {
    fn start_mix(
        &self,
        utxo: &WhirlpoolUtxo,
        listener: MixListener,
    ) -> Result<MixSessionHandle, SchedulerError>;
}

/// Handle on a running session, used only to request cancellation
#[derive(Default)]
pub struct MixSessionHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl MixSessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle whose cancellation runs `cancel`; the runner still has to report
    /// the outcome through the listener
    pub fn with_cancel(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for MixSessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixSessionHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Callbacks for one mix session
///
/// Cloneable and callable from any thread. Only the first completion
/// (success or failure) is delivered to the scheduler.
#[derive(Clone)]
pub struct MixListener {
    key: String,
    sender: Sender<Command>,
    completed: Arc<AtomicBool>,
}

impl fmt::Debug for MixListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixListener")
            .field("key", &self.key)
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MixListener {
    pub(crate) fn new(key: String, sender: Sender<Command>) -> Self {
        Self {
            key,
            sender,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn utxo_key(&self) -> &str {
        &self.key
    }

    pub fn on_success(&self) {
        self.complete(MixOutcome::Success);
    }

    pub fn on_fail(&self) {
        self.complete(MixOutcome::Failed);
    }

    pub fn on_progress(&self, step: MixStep, step_info: &str, step_number: u32, total_steps: u32) {
        debug!(
            "mix progress {}: {:?} {} ({}/{})",
            self.key, step, step_info, step_number, total_steps
        );
    }

    fn complete(&self, outcome: MixOutcome) {
        if self.completed.swap(true, Ordering::SeqCst) {
            debug!("mix {} already completed, ignoring {:?}", self.key, outcome);
            return;
        }
        // Scheduler already gone: nothing left to notify
        let _ = self.sender.send(Command::MixCompleted {
            key: self.key.clone(),
            outcome,
        });
    }
}

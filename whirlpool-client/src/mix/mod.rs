//! Mix scheduling
//!
//! Decides which queued UTXOs start a mix session and when. Sessions
//! themselves run in an external [`MixSessionRunner`].

pub mod priority;
pub mod scheduler;
pub mod session;

use thiserror::Error;

pub use priority::{DefaultUtxoPriority, UtxoPriority};
pub use scheduler::{MixScheduler, MixSchedulerHandle, MixSchedulerState};
pub use session::{MixListener, MixOutcome, MixSessionHandle, MixSessionRunner, MixStep};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Utxo {0} has no pool assigned")]
    NoPool(String),

    #[error("Utxo {0} is already mixing")]
    AlreadyMixing(String),

    #[error("Unknown utxo {0}")]
    UnknownUtxo(String),

    #[error("Mix scheduler is stopped")]
    Stopped,

    #[error("Mix session could not start: {0}")]
    Runner(String),
}

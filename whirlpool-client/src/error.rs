//! Standardized error handling for the Whirlpool client core
//!
//! Each fallible domain owns a `thiserror` enum (`Tx0Error` here, the others
//! next to the code that raises them). `WhirlpoolError` wraps all of them so
//! callers that don't care about the domain get one type with a category and
//! a sanitized user message.
//!
//! # Security Considerations
//!
//! - Error messages never carry private key bytes or fee-proof plaintext
//! - Fatal Tx0 errors carry every computed amount so an arithmetic bug can be
//!   diagnosed from the log line alone
//!
//! # Usage
//!
//! ```
//! use whirlpool_client::error::{ErrorCategory, Tx0Error, WhirlpoolError};
//!
//! let err: WhirlpoolError = Tx0Error::InsufficientBalance {
//!     balance: 1_000,
//!     required: 50_000_000,
//! }
//! .into();
//! assert_eq!(err.category(), ErrorCategory::UserCorrectable);
//! ```

use std::io;

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::mix::SchedulerError;
use crate::persistence::PersistError;
use crate::tx0::fee_proof::FeeProofError;

/// Errors raised while sizing, assembling or verifying a Tx0
#[derive(Debug, Error)]
pub enum Tx0Error {
    /// Funding balance below the minimum for the requested premix outputs
    #[error("Insufficient balance to mix: balance={balance} sats, required={required} sats")]
    InsufficientBalance { balance: u64, required: u64 },

    /// No candidate pool accepts the UTXO value
    #[error("No pool can receive {nb_outputs_min} premix output(s) from {utxo_value} sats")]
    NoEligiblePool { utxo_value: u64, nb_outputs_min: u32 },

    /// The solver could not fit a single premix output
    #[error(
        "Invalid nbPremix={nb_premix} (balance={balance}, premixValue={premix_value}, \
         poolFee={pool_fee}, feeTx0={fee_tx0}, maxOutputs={max_outputs:?})"
    )]
    NoPremixOutputs {
        nb_premix: u32,
        balance: u64,
        premix_value: u64,
        pool_fee: u64,
        fee_tx0: u64,
        max_outputs: Option<u32>,
    },

    /// Change went negative after the balance check already passed
    #[error(
        "Negative change detected: balance={balance}, nbPremix={nb_premix}, \
         premixValue={premix_value}, feeAmount={fee_amount}, minerFee={miner_fee}, \
         spendValue={spend_value}"
    )]
    NegativeChange {
        balance: u64,
        nb_premix: u32,
        premix_value: u64,
        fee_amount: u64,
        miner_fee: u64,
        spend_value: u64,
    },

    /// Fee-proof output does not have the fixed protocol length
    #[error("Invalid fee-proof length: expected {expected} bytes, got {actual}")]
    InvalidFeeProofLength { expected: usize, actual: usize },

    /// Fee-proof encoding failed
    #[error("Fee-proof encoding failed: {0}")]
    FeeProof(#[from] FeeProofError),

    /// Coordinator fee data is missing or malformed
    #[error("Invalid Tx0 data: {0}")]
    InvalidTx0Data(String),

    /// Coordinator fee data could not be fetched
    #[error("Tx0 data unavailable: {message}")]
    Tx0DataUnavailable { message: String },

    /// Caller passed inconsistent inputs
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Address from a collaborator is unusable
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Signing the funding input failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The assembled transaction failed structural verification
    #[error("Tx0 verification failed: {0}")]
    VerificationFailed(String),
}

impl Tx0Error {
    /// True for the errors that signal an arithmetic or invariant violation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Tx0Error::NoPremixOutputs { .. }
                | Tx0Error::NegativeChange { .. }
                | Tx0Error::InvalidFeeProofLength { .. }
                | Tx0Error::Signing(_)
                | Tx0Error::VerificationFailed(_)
        ) || matches!(self, Tx0Error::FeeProof(err) if !err.is_service_data())
    }
}

/// The main error type of the Whirlpool client core
#[derive(Debug, Error)]
pub enum WhirlpoolError {
    #[error("Tx0 error: {0}")]
    Tx0(#[from] Tx0Error),

    #[error("Fee-proof error: {0}")]
    FeeProof(#[from] FeeProofError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<io::Error> for WhirlpoolError {
    fn from(err: io::Error) -> Self {
        WhirlpoolError::Io {
            context: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for WhirlpoolError {
    fn from(err: serde_json::Error) -> Self {
        WhirlpoolError::Serialization {
            context: format!("JSON serialization error: {}", err),
            source: err,
        }
    }
}

/// Attach context to an I/O result
pub fn with_io_context<T>(
    result: Result<T, io::Error>,
    context: impl Into<String>,
) -> WhirlpoolResult<T> {
    result.map_err(|err| WhirlpoolError::Io {
        context: context.into(),
        source: err,
    })
}

/// Type alias for a Result with WhirlpoolError
pub type WhirlpoolResult<T> = Result<T, WhirlpoolError>;

/// Error category for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input the user can fix, never retried
    UserCorrectable,
    /// Service or network hiccup
    Transient,
    /// Invariant violation, abort with diagnostics
    Fatal,
    /// Admission was refused by the mix scheduler
    Scheduler,
    Config,
    Io,
    Serialization,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserCorrectable => "UserCorrectable",
            ErrorCategory::Transient => "Transient",
            ErrorCategory::Fatal => "Fatal",
            ErrorCategory::Scheduler => "Scheduler",
            ErrorCategory::Config => "Config",
            ErrorCategory::Io => "Io",
            ErrorCategory::Serialization => "Serialization",
        }
    }
}

impl WhirlpoolError {
    /// Get the category of this error for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            WhirlpoolError::Tx0(err) => match err {
                Tx0Error::InsufficientBalance { .. }
                | Tx0Error::NoEligiblePool { .. }
                | Tx0Error::InvalidArgument(_)
                | Tx0Error::InvalidAddress(_) => ErrorCategory::UserCorrectable,
                Tx0Error::Tx0DataUnavailable { .. } | Tx0Error::InvalidTx0Data(_) => {
                    ErrorCategory::Transient
                }
                Tx0Error::FeeProof(err) if err.is_service_data() => ErrorCategory::Transient,
                _ => ErrorCategory::Fatal,
            },
            WhirlpoolError::FeeProof(err) if err.is_service_data() => ErrorCategory::Transient,
            WhirlpoolError::FeeProof(_) => ErrorCategory::Fatal,
            WhirlpoolError::Backend(_) => ErrorCategory::Transient,
            WhirlpoolError::Scheduler(_) => ErrorCategory::Scheduler,
            WhirlpoolError::Persist(PersistError::Io { .. }) => ErrorCategory::Io,
            WhirlpoolError::Persist(_) => ErrorCategory::Serialization,
            WhirlpoolError::Config(_) => ErrorCategory::Config,
            WhirlpoolError::Io { .. } => ErrorCategory::Io,
            WhirlpoolError::Serialization { .. } => ErrorCategory::Serialization,
        }
    }

    /// Get a sanitized message suitable for displaying to users
    pub fn user_message(&self) -> String {
        match self {
            WhirlpoolError::Tx0(Tx0Error::InsufficientBalance { balance, required }) => format!(
                "Insufficient balance: {} sats available, {} sats required",
                balance, required
            ),
            WhirlpoolError::Tx0(Tx0Error::NoEligiblePool { utxo_value, .. }) => {
                format!("No pool accepts a UTXO of {} sats", utxo_value)
            }
            WhirlpoolError::Tx0(Tx0Error::FeeProof(err)) | WhirlpoolError::FeeProof(err)
                if err.is_service_data() =>
            {
                format!("Coordinator sent invalid fee data: {}", err)
            }
            WhirlpoolError::Tx0(Tx0Error::Signing(_)) | WhirlpoolError::FeeProof(_) => {
                "A security error occurred".to_string()
            }
            WhirlpoolError::Tx0(Tx0Error::FeeProof(_)) => "A security error occurred".to_string(),
            WhirlpoolError::Tx0(err) if err.is_fatal() => {
                "Internal error while building Tx0, see logs".to_string()
            }
            WhirlpoolError::Tx0(err) => err.to_string(),
            WhirlpoolError::Backend(err) => format!("Backend error: {}", err),
            WhirlpoolError::Scheduler(err) => format!("Mix error: {}", err),
            WhirlpoolError::Persist(err) => format!("Data format error: {}", err),
            WhirlpoolError::Config(err) => format!("Configuration error: {}", err),
            WhirlpoolError::Io { context, .. } => format!("File operation error: {}", context),
            WhirlpoolError::Serialization { context, .. } => {
                format!("Data format error: {}", context)
            }
        }
    }
}

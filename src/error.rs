//! Error types for the learning engine.

use thiserror::Error;

use crate::base::Word;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LearnerError>;

/// Errors raised by the observation table and the learning loop.
///
/// Unclosed rows, inconsistencies and counterexamples are *not* errors; they
/// are normal control flow. Everything here is either caller misuse (the
/// engine is left unusable), an oracle contradicting an established
/// invariant, or an observed cancellation.
#[derive(Debug, Error)]
pub enum LearnerError {
    /// `initialize` was called on a table that already holds rows.
    #[error("observation table is already initialized")]
    AlreadyInitialized,

    /// An operation that requires an initialized table ran before `initialize`.
    #[error("observation table is not initialized yet")]
    NotInitialized,

    /// The initial short prefixes were not prefix-closed, or ε was not first.
    #[error("initial short prefixes must be prefix-closed and start with the empty word")]
    InvalidInitialPrefixes,

    /// A counter limit was not strictly larger than the current one.
    #[error("counter limit may only increase (current {current}, requested {requested})")]
    CounterLimitNotIncreased { current: i64, requested: i64 },

    /// A symbol outside the table's alphabet was used.
    #[error("symbol `{symbol}` is not part of the alphabet")]
    UnknownSymbol { symbol: String },

    /// The final hypothesis was requested before the experiment ran.
    #[error("no hypothesis available before the experiment has run")]
    NoHypothesisYet,

    /// An oracle answer contradicts an invariant established earlier.
    #[error("oracle disagreement on `{word}`: {detail}")]
    OracleDisagreement { word: Word, detail: String },

    /// The cancellation token was observed mid-fill; the table was left in
    /// its pre-mutation state.
    #[error("operation cancelled")]
    Cancelled,
}

impl LearnerError {
    /// Create an [`LearnerError::OracleDisagreement`] for `word`.
    pub fn disagreement(word: &Word, detail: impl Into<String>) -> Self {
        Self::OracleDisagreement {
            word: word.clone(),
            detail: detail.into(),
        }
    }
}

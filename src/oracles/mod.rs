//! Oracle interfaces the learner consumes, plus reference implementations
//! backed by a concrete target automaton.
//!
//! Batching is the caller's responsibility: the core hands a membership
//! oracle an ordered query list and consumes the answers in the same order.
//! Adapters are free to cache, count or parallelise internally.

mod bfs_eq;
mod simulation;

pub use bfs_eq::BfsEquivalenceOracle;
pub use simulation::{RestrictedRocaOracle, RocaSimulator};

use crate::automata::{CounterAutomaton, Dfa};
use crate::base::{Alphabet, Word};
use crate::error::Result;

/// A single membership-style query with an in-place answer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<D> {
    prefix: Word,
    suffix: Word,
    output: Option<D>,
}

impl<D> Query<D> {
    pub fn new(prefix: Word, suffix: Word) -> Self {
        Self {
            prefix,
            suffix,
            output: None,
        }
    }

    pub fn prefix(&self) -> &Word {
        &self.prefix
    }

    pub fn suffix(&self) -> &Word {
        &self.suffix
    }

    /// The queried word `prefix · suffix`.
    pub fn word(&self) -> Word {
        self.prefix.concat(&self.suffix)
    }

    pub fn answer(&mut self, output: D) {
        self.output = Some(output);
    }

    pub fn output(&self) -> Option<&D> {
        self.output.as_ref()
    }
}

/// Three-valued membership answer.
///
/// `Exit` states that the word has left the prefix-closure of the target
/// language: it is rejected, and so is every extension. This is the channel
/// through which the learner acquires prefix(L) knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptingOrExit {
    Accepting,
    Rejecting,
    Exit,
}

impl AcceptingOrExit {
    pub fn is_accepting(self) -> bool {
        matches!(self, Self::Accepting)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Self::Exit)
    }
}

/// Answers batched membership queries in place.
pub trait MembershipOracle {
    type Output: Clone;

    /// Fill every query's output. Answers are consumed strictly in the
    /// order the queries appear.
    fn process_queries(&mut self, queries: &mut [Query<Self::Output>]);
}

/// Answers counter-value queries.
///
/// Only valid when `prefix · suffix` is in the prefix-closure of the target
/// language; the table guards every call with its prefix knowledge.
pub trait CounterValueOracle {
    fn answer_query(&mut self, prefix: &Word, suffix: &Word) -> Result<i64>;
}

/// Compares a candidate DFA against the target restricted to runs whose
/// counter stays within the configured limit.
pub trait RestrictedEquivalenceOracle {
    fn set_counter_limit(&mut self, limit: i64);

    fn counter_limit(&self) -> i64;

    /// A word on which the candidate and the restricted target disagree,
    /// with the restricted target's verdict as the query output.
    fn find_counter_example(&mut self, candidate: &Dfa, inputs: &Alphabet) -> Option<Query<bool>>;
}

/// Compares a candidate ROCA against the full target language.
pub trait RocaEquivalenceOracle {
    /// A word on which the hypothesis and the target disagree, with the
    /// target's verdict as the query output. `None` means no counterexample
    /// was found (or cancellation was observed).
    fn find_counter_example<H: CounterAutomaton>(
        &mut self,
        hypothesis: &H,
        inputs: &Alphabet,
    ) -> Option<Query<bool>>;

    /// Drop exploration state carried over from a previous hypothesis.
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_word_concatenates() {
        let q: Query<bool> = Query::new(
            Word::from_symbols("ab".chars()),
            Word::from_symbols("c".chars()),
        );
        assert_eq!(q.word(), Word::from_symbols("abc".chars()));
        assert_eq!(q.output(), None);
    }

    #[test]
    fn test_answer_fills_in_place() {
        let mut q: Query<AcceptingOrExit> = Query::new(Word::epsilon(), Word::epsilon());
        q.answer(AcceptingOrExit::Accepting);
        assert!(q.output().unwrap().is_accepting());
    }
}

use crate::automata::{Dfa, RocaFromDescription};
use crate::base::{Alphabet, CancellationToken, Word};
use crate::error::{LearnerError, Result};
use crate::oracles::{
    AcceptingOrExit, CounterValueOracle, MembershipOracle, Query, RestrictedEquivalenceOracle,
};
use crate::table::{
    ObservationTable, PrefixLookup, RocaTablePolicy, RowId, UnclosedGroups,
};

use super::HypothesisBuilder;

/// The L*-style learner for realtime one-counter automata.
///
/// Owns the counter-annotated observation table and the query-side oracles
/// (membership, counter value, restricted equivalence). The outer experiment
/// drives it through [`Self::start_learning`], [`Self::hypotheses`] and
/// [`Self::refine_hypothesis`], the sole public mutator after start-up.
pub struct LStarRoca<M, C, R> {
    table: ObservationTable<RocaTablePolicy>,
    membership: M,
    counter: C,
    restricted: R,
    token: CancellationToken,
    started: bool,
}

impl<M, C, R> LStarRoca<M, C, R>
where
    M: MembershipOracle<Output = AcceptingOrExit>,
    C: CounterValueOracle,
    R: RestrictedEquivalenceOracle,
{
    pub fn new(alphabet: Alphabet, membership: M, counter: C, restricted: R) -> Self {
        Self {
            table: ObservationTable::new(alphabet, RocaTablePolicy, 0),
            membership,
            counter,
            restricted,
            token: CancellationToken::new(),
            started: false,
        }
    }

    /// Observe `token` during table fills and stabilisation.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.table.set_cancellation(token.clone());
        self.token = token;
    }

    pub fn table(&self) -> &ObservationTable<RocaTablePolicy> {
        &self.table
    }

    pub fn counter_limit(&self) -> i64 {
        self.table.counter_limit()
    }

    /// Fill the initial table (short prefixes {ε}, suffixes {ε}) and drive
    /// it to the closed, consistent, restricted-equivalent fixpoint.
    pub fn start_learning(&mut self) -> Result<()> {
        let unclosed = self.table.initialize(
            &[Word::epsilon()],
            &[Word::epsilon()],
            &mut self.membership,
            &mut self.counter,
        )?;
        self.started = true;
        self.stabilize(unclosed)
    }

    /// Candidate hypotheses for the current table, rebuilt from scratch.
    pub fn hypotheses(&self) -> Vec<RocaFromDescription> {
        HypothesisBuilder::new(&self.table).candidates()
    }

    /// The restricted behaviour learned so far, as a DFA over the classes.
    pub fn learned_dfa(&self) -> Dfa {
        HypothesisBuilder::new(&self.table).learned_dfa()
    }

    /// Process a full-equivalence counterexample. Returns `true` iff the
    /// table strictly grew (new contents, suffixes, rows, or a raised
    /// counter limit); the experiment asserts this every round.
    pub fn refine_hypothesis(&mut self, counterexample: &Word) -> Result<bool> {
        if !self.started {
            return Err(LearnerError::NotInitialized);
        }
        let before = self.fingerprint();
        let highest = self.max_counter_along(counterexample)?;
        if highest > self.table.counter_limit() {
            self.escalate(counterexample)?;
        } else {
            tracing::debug!(ce = %counterexample, "refining at the current counter limit");
            let unclosed = self.absorb_counterexample(counterexample)?;
            self.stabilize(unclosed)?;
            if self.fingerprint() == before {
                // the counterexample added nothing at this limit; the
                // hypothesis was wrong above it
                self.escalate(counterexample)?;
            }
        }
        Ok(self.fingerprint() != before)
    }

    // ------------------------------------------------------------------

    fn fingerprint(&self) -> (usize, usize, usize, i64) {
        let (rows, suffixes, contents) = self.table.size_fingerprint();
        (rows, suffixes, contents, self.table.counter_limit())
    }

    fn escalate(&mut self, counterexample: &Word) -> Result<()> {
        let new_limit = self.table.counter_limit() + 1;
        tracing::debug!(ce = %counterexample, new_limit, "escalating counter limit");
        let prefixes: Vec<Word> = counterexample.prefixes().collect();
        let suffixes: Vec<Word> = counterexample.suffixes().collect();
        let unclosed = self.table.increase_counter_limit(
            new_limit,
            &prefixes,
            &suffixes,
            &mut self.membership,
            &mut self.counter,
        )?;
        self.stabilize(unclosed)
    }

    /// Add a counterexample's prefixes as short prefixes and its suffixes
    /// as columns.
    fn absorb_counterexample(&mut self, word: &Word) -> Result<UnclosedGroups> {
        let prefixes: Vec<Word> = word.prefixes().collect();
        self.table
            .add_short_prefixes(&prefixes, &mut self.membership, &mut self.counter)?;
        let suffixes: Vec<Word> = word.suffixes().collect();
        self.table
            .add_suffixes(&suffixes, &mut self.membership, &mut self.counter)
    }

    /// Resolve closure and consistency, then chase restricted-equivalence
    /// counterexamples, until the table is stable. Hypotheses are only
    /// constructed from stable tables.
    fn stabilize(&mut self, mut unclosed: UnclosedGroups) -> Result<()> {
        loop {
            if self.token.is_cancelled() {
                return Err(LearnerError::Cancelled);
            }
            if !unclosed.is_empty() {
                let promote: Vec<RowId> = unclosed.iter().map(|group| group.rows[0]).collect();
                tracing::trace!(groups = promote.len(), "resolving unclosed rows");
                unclosed =
                    self.table
                        .promote_to_short(&promote, &mut self.membership, &mut self.counter)?;
                continue;
            }
            if let Some(inconsistency) = self.table.find_inconsistency() {
                let Some(suffix) = self.table.distinguishing_suffix(&inconsistency) else {
                    let left = self.table.row(inconsistency.left).label().clone();
                    return Err(LearnerError::disagreement(
                        &left,
                        "inconsistent rows with no distinguishing suffix",
                    ));
                };
                tracing::trace!(suffix = %suffix, "resolving inconsistency");
                unclosed =
                    self.table
                        .add_suffixes(&[suffix], &mut self.membership, &mut self.counter)?;
                continue;
            }
            self.restricted.set_counter_limit(self.table.counter_limit());
            let dfa = self.learned_dfa();
            if let Some(ce) = self
                .restricted
                .find_counter_example(&dfa, self.table.alphabet())
            {
                let word = ce.word();
                tracing::debug!(ce = %word, "restricted counterexample");
                unclosed = self.absorb_counterexample(&word)?;
                continue;
            }
            return Ok(());
        }
    }

    /// The highest counter value the target reaches along the prefixes of
    /// `word`, stopping at the first prefix outside prefix(L). The prefix
    /// tracker screens out counter-value queries on non-prefix words.
    fn max_counter_along(&mut self, word: &Word) -> Result<i64> {
        let mut highest = 0;
        for prefix in word.prefixes() {
            let in_prefix = match self.table.tracker().lookup(&prefix, self.table.alphabet()) {
                PrefixLookup::False => false,
                PrefixLookup::True => true,
                PrefixLookup::Unknown => {
                    let mut queries = [Query::new(prefix.clone(), Word::epsilon())];
                    self.membership.process_queries(&mut queries);
                    match queries[0].output() {
                        Some(output) => !output.is_exit(),
                        None => {
                            return Err(LearnerError::disagreement(
                                &prefix,
                                "membership oracle left a query unanswered",
                            ));
                        }
                    }
                }
            };
            if !in_prefix {
                break;
            }
            let value = self.counter.answer_query(&prefix, &Word::epsilon())?;
            highest = highest.max(value);
        }
        Ok(highest)
    }
}

use crate::automata::RocaFromDescription;
use crate::base::{CancellationToken, Word};
use crate::error::{LearnerError, Result};
use crate::oracles::{
    AcceptingOrExit, CounterValueOracle, MembershipOracle, RestrictedEquivalenceOracle,
    RocaEquivalenceOracle,
};

use super::LStarRoca;

/// Result of a learning experiment.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A hypothesis the full-equivalence oracle could not refute.
    Converged(RocaFromDescription),
    /// The round budget ran out before convergence.
    BudgetExhausted { rounds: usize },
    /// Cancellation was observed; the learner is left resumable.
    Cancelled,
}

impl Outcome {
    pub fn hypothesis(&self) -> Option<&RocaFromDescription> {
        match self {
            Self::Converged(hypothesis) => Some(hypothesis),
            _ => None,
        }
    }
}

/// The round driver: materialise candidates, query full equivalence for
/// each, accept the first unrefuted candidate or dispatch the first
/// counterexample back into the learner.
pub struct Experiment<M, C, R, E> {
    learner: LStarRoca<M, C, R>,
    equivalence: E,
    max_rounds: usize,
    token: CancellationToken,
    rounds: usize,
    final_hypothesis: Option<RocaFromDescription>,
}

impl<M, C, R, E> Experiment<M, C, R, E>
where
    M: MembershipOracle<Output = AcceptingOrExit>,
    C: CounterValueOracle,
    R: RestrictedEquivalenceOracle,
    E: RocaEquivalenceOracle,
{
    pub fn new(learner: LStarRoca<M, C, R>, equivalence: E, max_rounds: usize) -> Self {
        Self {
            learner,
            equivalence,
            max_rounds,
            token: CancellationToken::new(),
            rounds: 0,
            final_hypothesis: None,
        }
    }

    /// Wire a shared cancellation token through the learner and the driver.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.learner.set_cancellation(token.clone());
        self.token = token;
        self
    }

    pub fn learner(&self) -> &LStarRoca<M, C, R> {
        &self.learner
    }

    /// Rounds completed by the last run.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// The converged hypothesis of the last run.
    pub fn final_hypothesis(&self) -> Result<&RocaFromDescription> {
        self.final_hypothesis
            .as_ref()
            .ok_or(LearnerError::NoHypothesisYet)
    }

    pub fn run(&mut self) -> Result<Outcome> {
        self.learner.start_learning()?;
        for round in 0..self.max_rounds {
            self.rounds = round + 1;
            let candidates = self.learner.hypotheses();
            let mut first_counterexample: Option<Word> = None;
            let mut accepted: Option<RocaFromDescription> = None;
            for hypothesis in &candidates {
                self.equivalence.reset();
                match self
                    .equivalence
                    .find_counter_example(hypothesis, self.learner.table().alphabet())
                {
                    None if self.token.is_cancelled() => return Ok(Outcome::Cancelled),
                    None => {
                        accepted = Some(hypothesis.clone());
                        break;
                    }
                    Some(ce) => {
                        if first_counterexample.is_none() {
                            first_counterexample = Some(ce.word());
                        }
                    }
                }
            }
            if let Some(hypothesis) = accepted {
                tracing::debug!(round, period = hypothesis.period(), "converged");
                self.final_hypothesis = Some(hypothesis.clone());
                return Ok(Outcome::Converged(hypothesis));
            }
            let Some(counterexample) = first_counterexample else {
                return Err(LearnerError::disagreement(
                    &Word::epsilon(),
                    "no candidate hypothesis was produced",
                ));
            };
            tracing::debug!(round, ce = %counterexample, "dispatching counterexample");
            let grew = self.learner.refine_hypothesis(&counterexample)?;
            debug_assert!(grew, "every round must strictly grow the table");
        }
        Ok(Outcome::BudgetExhausted {
            rounds: self.max_rounds,
        })
    }
}

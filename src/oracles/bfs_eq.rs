use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::automata::{Config, CounterAutomaton};
use crate::base::{Alphabet, CancellationToken, Word};

use super::simulation::{HasParent, reconstruct_word};
use super::{Query, RocaEquivalenceOracle};

/// Exploration-based equivalence oracle for one-counter hypotheses.
///
/// Runs a breadth-first search over pairs of configurations of the
/// hypothesis and the reference, up to a counter bound of
/// M = (|H| · |ref|)². A pair with differing acceptance yields the path
/// word. Pairs whose counters exceed the bound are parked in a persistent
/// frontier; a later invocation (with a larger bound, e.g. after the
/// hypothesis grew) resumes from them.
///
/// Cancellation is observed at every dequeue; a cancelled search returns
/// `None` with the frontier intact.
#[derive(Debug, Clone)]
pub struct BfsEquivalenceOracle<R: CounterAutomaton> {
    reference: R,
    token: CancellationToken,
    nodes: Vec<PairNode>,
    queue: VecDeque<usize>,
    parked: Vec<usize>,
    visited: FxHashSet<(Option<Config>, Option<Config>)>,
}

#[derive(Debug, Clone, Copy)]
struct PairNode {
    hypothesis: Option<Config>,
    reference: Option<Config>,
    parent: Option<(usize, usize)>,
}

impl HasParent for PairNode {
    fn parent_link(&self) -> Option<(usize, usize)> {
        self.parent
    }
}

impl<R: CounterAutomaton> BfsEquivalenceOracle<R> {
    pub fn new(reference: R) -> Self {
        Self::with_token(reference, CancellationToken::new())
    }

    pub fn with_token(reference: R, token: CancellationToken) -> Self {
        Self {
            reference,
            token,
            nodes: Vec::new(),
            queue: VecDeque::new(),
            parked: Vec::new(),
            visited: FxHashSet::default(),
        }
    }

    pub fn reference(&self) -> &R {
        &self.reference
    }

    fn counter_bound<H: CounterAutomaton>(&self, hypothesis: &H) -> i64 {
        let pairs = hypothesis.state_count().max(1) * self.reference.state_count().max(1);
        (pairs as i64).pow(2)
    }
}

impl<R: CounterAutomaton> RocaEquivalenceOracle for BfsEquivalenceOracle<R> {
    fn find_counter_example<H: CounterAutomaton>(
        &mut self,
        hypothesis: &H,
        inputs: &Alphabet,
    ) -> Option<Query<bool>> {
        let bound = self.counter_bound(hypothesis);

        if self.nodes.is_empty() {
            let root = PairNode {
                hypothesis: Some(hypothesis.initial()),
                reference: Some(self.reference.initial()),
                parent: None,
            };
            self.visited.insert((root.hypothesis, root.reference));
            self.nodes.push(root);
            self.queue.push_back(0);
        } else if !self.parked.is_empty() {
            tracing::trace!(parked = self.parked.len(), "resuming from parked frontier");
            self.queue.extend(self.parked.drain(..));
        }

        while let Some(index) = self.queue.pop_front() {
            if self.token.is_cancelled() {
                self.queue.push_front(index);
                let remaining: Vec<_> = self.queue.drain(..).collect();
                self.parked.extend(remaining);
                return None;
            }

            let node = self.nodes[index];
            let hyp_accepts = node
                .hypothesis
                .is_some_and(|c| hypothesis.is_accepting(c));
            let ref_accepts = node
                .reference
                .is_some_and(|c| self.reference.is_accepting(c));
            if hyp_accepts != ref_accepts {
                let word = reconstruct_word(&self.nodes, index, inputs);
                tracing::debug!(%word, "acceptance mismatch found");
                let mut query = Query::new(word, Word::epsilon());
                query.answer(ref_accepts);
                return Some(query);
            }

            for symbol in 0..inputs.len() {
                let hyp_next = node.hypothesis.and_then(|c| hypothesis.step(c, symbol));
                let ref_next = node.reference.and_then(|c| self.reference.step(c, symbol));
                if hyp_next.is_none() && ref_next.is_none() {
                    continue;
                }
                if !self.visited.insert((hyp_next, ref_next)) {
                    continue;
                }
                self.nodes.push(PairNode {
                    hypothesis: hyp_next,
                    reference: ref_next,
                    parent: Some((index, symbol)),
                });
                let child = self.nodes.len() - 1;
                let beyond = hyp_next.is_some_and(|c| c.counter > bound)
                    || ref_next.is_some_and(|c| c.counter > bound);
                if beyond {
                    self.parked.push(child);
                } else {
                    self.queue.push_back(child);
                }
            }
        }
        None
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.queue.clear();
        self.parked.clear();
        self.visited.clear();
    }
}

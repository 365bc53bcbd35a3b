use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::automata::{Config, CounterAutomaton, Dfa, Roca};
use crate::base::{Alphabet, Word};
use crate::error::{LearnerError, Result};

use super::{AcceptingOrExit, CounterValueOracle, MembershipOracle, Query, RestrictedEquivalenceOracle};

/// Membership and counter-value oracles backed by an explicit target [`Roca`].
///
/// Membership answers are three-valued: a word whose run dies, or whose
/// reached configuration cannot reach an accepting configuration any more,
/// is reported as [`AcceptingOrExit::Exit`].
#[derive(Debug, Clone)]
pub struct RocaSimulator {
    target: Roca,
}

impl RocaSimulator {
    pub fn new(target: Roca) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Roca {
        &self.target
    }

    /// Whether some accepting configuration is reachable from `config`.
    ///
    /// One-counter reachability never needs the counter to climb more than
    /// quadratically in the location count above its start, so the search is
    /// capped there and stays finite.
    fn is_live(&self, config: Config) -> bool {
        let n = self.target.location_count() as i64;
        let cap = config.counter + n * n + n + 1;
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::new();
        visited.insert(config);
        queue.push_back(config);
        while let Some(current) = queue.pop_front() {
            if self.target.is_accepting(current) {
                return true;
            }
            for symbol in 0..self.target.alphabet().len() {
                let Some(next) = self.target.step(current, symbol) else {
                    continue;
                };
                if next.counter <= cap && visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    fn classify(&self, word: &Word) -> AcceptingOrExit {
        match self.target.run(word) {
            None => AcceptingOrExit::Exit,
            Some(config) if self.target.is_accepting(config) => AcceptingOrExit::Accepting,
            Some(config) => {
                if self.is_live(config) {
                    AcceptingOrExit::Rejecting
                } else {
                    AcceptingOrExit::Exit
                }
            }
        }
    }
}

impl MembershipOracle for RocaSimulator {
    type Output = AcceptingOrExit;

    fn process_queries(&mut self, queries: &mut [Query<AcceptingOrExit>]) {
        for query in queries {
            let answer = self.classify(&query.word());
            query.answer(answer);
        }
    }
}

impl CounterValueOracle for RocaSimulator {
    fn answer_query(&mut self, prefix: &Word, suffix: &Word) -> Result<i64> {
        let word = prefix.concat(suffix);
        match self.target.counter_value(&word) {
            Some(value) => Ok(value),
            None => Err(LearnerError::disagreement(
                &word,
                "counter value requested for a word outside the language prefixes",
            )),
        }
    }
}

/// Exact restricted-equivalence oracle backed by a target [`Roca`].
///
/// The target restricted to counter ≤ limit is a finite automaton, so a
/// product breadth-first search against the candidate DFA decides
/// equivalence exactly and yields a shortest counterexample.
#[derive(Debug, Clone)]
pub struct RestrictedRocaOracle {
    target: Roca,
    limit: i64,
}

impl RestrictedRocaOracle {
    pub fn new(target: Roca, limit: i64) -> Self {
        Self { target, limit }
    }

    /// Step in the restricted view: exceeding the limit is the sink.
    fn restricted_step(&self, config: Config, symbol: usize) -> Option<Config> {
        let next = self.target.step(config, symbol)?;
        (next.counter <= self.limit).then_some(next)
    }
}

#[derive(Debug, Clone, Copy)]
struct ProductNode {
    dfa: Option<usize>,
    target: Option<Config>,
    parent: Option<(usize, usize)>,
}

impl RestrictedEquivalenceOracle for RestrictedRocaOracle {
    fn set_counter_limit(&mut self, limit: i64) {
        self.limit = limit;
    }

    fn counter_limit(&self) -> i64 {
        self.limit
    }

    fn find_counter_example(&mut self, candidate: &Dfa, inputs: &Alphabet) -> Option<Query<bool>> {
        let mut nodes = vec![ProductNode {
            dfa: Some(candidate.initial_state()),
            target: Some(self.target.initial()),
            parent: None,
        }];
        let mut visited: FxHashSet<(Option<usize>, Option<Config>)> = FxHashSet::default();
        visited.insert((nodes[0].dfa, nodes[0].target));
        let mut queue = VecDeque::from([0usize]);

        while let Some(index) = queue.pop_front() {
            let node = nodes[index];
            let dfa_accepts = node.dfa.is_some_and(|s| candidate.is_accepting_state(s));
            let target_accepts = node.target.is_some_and(|c| self.target.is_accepting(c));
            if dfa_accepts != target_accepts {
                let word = reconstruct_word(&nodes, index, inputs);
                let mut query = Query::new(word, Word::epsilon());
                query.answer(target_accepts);
                return Some(query);
            }
            for symbol in 0..inputs.len() {
                let dfa_next = node.dfa.and_then(|s| candidate.next_state(s, symbol));
                let target_next = node.target.and_then(|c| self.restricted_step(c, symbol));
                if dfa_next.is_none() && target_next.is_none() {
                    continue;
                }
                if visited.insert((dfa_next, target_next)) {
                    nodes.push(ProductNode {
                        dfa: dfa_next,
                        target: target_next,
                        parent: Some((index, symbol)),
                    });
                    queue.push_back(nodes.len() - 1);
                }
            }
        }
        None
    }
}

pub(super) fn reconstruct_word<N: HasParent>(nodes: &[N], mut index: usize, inputs: &Alphabet) -> Word {
    let mut symbols = Vec::new();
    while let Some((parent, symbol)) = nodes[index].parent_link() {
        symbols.push(inputs.get(symbol).expect("symbol index in range").clone());
        index = parent;
    }
    symbols.reverse();
    Word::from_symbols(symbols)
}

/// Parent-link access for breadth-first search arenas.
pub(super) trait HasParent {
    fn parent_link(&self) -> Option<(usize, usize)>;
}

impl HasParent for ProductNode {
    fn parent_link(&self) -> Option<(usize, usize)> {
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Word {
        Word::from_symbols(s.chars())
    }

    fn anbn() -> Roca {
        Roca::builder(Alphabet::from_symbols(["a", "b"]), 2)
            .accepting(0)
            .accepting(1)
            .on_any(0, "a", 0, 1)
            .unwrap()
            .on_positive(0, "b", 1, -1)
            .unwrap()
            .on_positive(1, "b", 1, -1)
            .unwrap()
            .build()
    }

    #[test]
    fn test_membership_classification() {
        let mut oracle = RocaSimulator::new(anbn());
        let mut queries = vec![
            Query::new(Word::epsilon(), Word::epsilon()),
            Query::new(w("aa"), w("b")),
            Query::new(w("a"), w("bb")),
            Query::new(w("b"), Word::epsilon()),
        ];
        oracle.process_queries(&mut queries);
        assert_eq!(queries[0].output(), Some(&AcceptingOrExit::Accepting));
        // `aab` is a strict prefix of `aabb`
        assert_eq!(queries[1].output(), Some(&AcceptingOrExit::Rejecting));
        assert_eq!(queries[2].output(), Some(&AcceptingOrExit::Exit));
        assert_eq!(queries[3].output(), Some(&AcceptingOrExit::Exit));
    }

    #[test]
    fn test_counter_value_queries() {
        let mut oracle = RocaSimulator::new(anbn());
        assert_eq!(oracle.answer_query(&w("aa"), &w("b")).unwrap(), 1);
        assert_eq!(oracle.answer_query(&w("aabb"), &Word::epsilon()).unwrap(), 0);
        assert!(oracle.answer_query(&w("ab"), &w("b")).is_err());
    }

    #[test]
    fn test_restricted_equivalence_at_limit_zero() {
        // at limit 0 the restricted language of aⁿbⁿ is {ε}
        let mut oracle = RestrictedRocaOracle::new(anbn(), 0);
        let alphabet = Alphabet::from_symbols(["a", "b"]);
        let mut only_epsilon = Dfa::new(alphabet.clone(), 1, 0);
        only_epsilon.set_accepting(0, true);
        assert!(oracle.find_counter_example(&only_epsilon, &alphabet).is_none());

        // at limit 1 it is {ε, ab}, so the ε-only candidate fails on `ab`
        oracle.set_counter_limit(1);
        let ce = oracle
            .find_counter_example(&only_epsilon, &alphabet)
            .expect("ab distinguishes");
        assert_eq!(ce.word(), w("ab"));
        assert_eq!(ce.output(), Some(&true));
    }
}

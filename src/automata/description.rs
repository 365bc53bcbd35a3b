use rustc_hash::FxHashMap;

use crate::base::{Alphabet, Word};

use super::{Config, CounterAutomaton};

type Edge = Option<(usize, i8)>;

/// The periodic extension of a skeleton: above the counter limit, the band
/// of levels `(limit − period, limit]` repeats with the given period.
///
/// `down` maps each band state to its counterpart one band below; `up` is
/// the inverse. Both are total on the states they mention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicExtension {
    pub period: i64,
    pub down: FxHashMap<usize, usize>,
    pub up: FxHashMap<usize, usize>,
}

/// A candidate ROCA materialised from an observation table: a finite
/// skeleton of states, each annotated with the counter value (level) it
/// lives at, plus an optional [`PeriodicExtension`] describing behaviour
/// above the counter limit.
///
/// Without an extension the value is the degenerate DFA view: every delta is
/// zero and the counter never moves (reported period 0).
///
/// Two builds from the same table are structurally equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RocaFromDescription {
    alphabet: Alphabet,
    /// Level (counter value) of each skeleton state.
    levels: Vec<i64>,
    accepting: Vec<bool>,
    initial: usize,
    /// Skeleton transitions; `None` is the rejecting sink.
    edges: Vec<Vec<Edge>>,
    counter_limit: i64,
    extension: Option<PeriodicExtension>,
}

impl RocaFromDescription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alphabet: Alphabet,
        levels: Vec<i64>,
        accepting: Vec<bool>,
        initial: usize,
        edges: Vec<Vec<Edge>>,
        counter_limit: i64,
        extension: Option<PeriodicExtension>,
    ) -> Self {
        debug_assert_eq!(levels.len(), accepting.len());
        debug_assert_eq!(levels.len(), edges.len());
        debug_assert!(initial < levels.len());
        Self {
            alphabet,
            levels,
            accepting,
            initial,
            edges,
            counter_limit,
            extension,
        }
    }

    /// The period of the extension; 0 for the plain DFA view.
    pub fn period(&self) -> i64 {
        self.extension.as_ref().map_or(0, |ext| ext.period)
    }

    /// The counter limit the skeleton was built at.
    pub fn counter_limit(&self) -> i64 {
        self.counter_limit
    }

    pub fn level_of(&self, state: usize) -> i64 {
        self.levels[state]
    }

    /// The band-representative level for counter value `cv` above the limit.
    fn band_level(&self, cv: i64) -> i64 {
        let ext = self.extension.as_ref().expect("band_level needs an extension");
        let base = self.counter_limit - ext.period + 1;
        base + (cv - base).rem_euclid(ext.period)
    }

    /// Move `state` along the band maps until its level is `level`.
    fn align(&self, mut state: usize, level: i64) -> Option<usize> {
        let ext = self.extension.as_ref()?;
        while self.levels[state] < level {
            state = *ext.up.get(&state)?;
        }
        while self.levels[state] > level {
            state = *ext.down.get(&state)?;
        }
        Some(state)
    }

    /// The edge to follow from `state` at counter `cv`.
    ///
    /// Up-edges out of the top level are invisible in the skeleton (their
    /// targets lay beyond the limit when the table was filled); they are
    /// reconstructed by mirroring the corresponding state one band below.
    fn resolve_edge(&self, state: usize, cv: i64, symbol: usize) -> Edge {
        if let Some(ext) = self.extension.as_ref() {
            if self.levels[state] == self.counter_limit && cv >= self.counter_limit {
                let low = *ext.down.get(&state)?;
                if let Some((target, 1)) = self.edges[low][symbol] {
                    // mirrored up-edge: the target sits one band higher than
                    // recorded, which `align` fixes up from the raw target
                    return Some((target, 1));
                }
            }
        }
        self.edges[state][symbol]
    }
}

impl CounterAutomaton for RocaFromDescription {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn state_count(&self) -> usize {
        self.levels.len()
    }

    fn initial(&self) -> Config {
        Config::new(self.initial, 0)
    }

    fn step(&self, config: Config, symbol: usize) -> Option<Config> {
        let Config { state, counter } = config;
        if self.extension.is_none() {
            // DFA view: the counter never moves
            let (target, _) = self.edges[state][symbol]?;
            return Some(Config::new(target, 0));
        }
        let (target, delta) = self.resolve_edge(state, counter, symbol)?;
        let counter = counter + i64::from(delta);
        if counter < 0 {
            return None;
        }
        let wanted = if counter <= self.counter_limit {
            counter
        } else {
            self.band_level(counter)
        };
        let state = if self.levels[target] == wanted {
            target
        } else {
            self.align(target, wanted)?
        };
        Some(Config::new(state, counter))
    }

    fn is_accepting(&self, config: Config) -> bool {
        config.counter == 0 && self.accepting[config.state]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Word {
        Word::from_symbols(s.chars())
    }

    /// Hand-built description of { aⁿbⁿ } at limit 2, period 1:
    /// q0 (level 0, accepting), q1 (level 1), q2 (level 2, band).
    fn anbn_description() -> RocaFromDescription {
        let alphabet = Alphabet::from_symbols(["a", "b"]);
        let edges = vec![
            vec![Some((1, 1)), None],          // q0: a ↑ q1
            vec![Some((2, 1)), Some((0, -1))], // q1: a ↑ q2, b ↓ q0
            vec![None, Some((1, -1))],         // q2: a masked (above limit), b ↓ q1
        ];
        let extension = PeriodicExtension {
            period: 1,
            down: FxHashMap::from_iter([(2, 1)]),
            up: FxHashMap::from_iter([(1, 2)]),
        };
        RocaFromDescription::new(
            alphabet,
            vec![0, 1, 2],
            vec![true, false, false],
            0,
            edges,
            2,
            Some(extension),
        )
    }

    #[test]
    fn test_periodic_simulation_below_and_above_limit() {
        let hyp = anbn_description();
        assert!(hyp.accepts(&w("")));
        assert!(hyp.accepts(&w("ab")));
        assert!(hyp.accepts(&w("aabb")));
        // counter climbs past the limit and back
        assert!(hyp.accepts(&w("aaaaabbbbb")));
        assert!(!hyp.accepts(&w("aaaaabbbb")));
        assert!(!hyp.accepts(&w("aab")));
        assert!(!hyp.accepts(&w("ba")));
    }

    #[test]
    fn test_dfa_view_keeps_counter_at_zero() {
        let alphabet = Alphabet::from_symbols(["a"]);
        let edges = vec![vec![Some((0, 1))]];
        let hyp = RocaFromDescription::new(
            alphabet,
            vec![0],
            vec![true],
            0,
            edges,
            0,
            None,
        );
        assert_eq!(hyp.period(), 0);
        assert!(hyp.accepts(&w("aaaa")));
        assert_eq!(hyp.run(&w("aaaa")), Some(Config::new(0, 0)));
    }

    #[test]
    fn test_structural_equality_of_rebuilds() {
        assert_eq!(anbn_description(), anbn_description());
    }
}

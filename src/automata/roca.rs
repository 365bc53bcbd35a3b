use crate::base::{Alphabet, Symbol, Word};
use crate::error::{LearnerError, Result};

use super::{Config, CounterAutomaton};

type Edge = Option<(usize, i8)>;

/// A realtime one-counter automaton in explicit form.
///
/// Each transition reads one symbol and adds −1, 0 or +1 to the counter; the
/// transition taken may depend on whether the counter is zero. The counter
/// never goes negative (zero-test transitions cannot pop). A word is accepted
/// when its run ends in an accepting location with counter 0.
///
/// Transitions are partial: a missing transition kills the run, placing the
/// word and all its extensions outside the prefix-closure of the language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roca {
    alphabet: Alphabet,
    initial: usize,
    accepting: Vec<bool>,
    /// Transitions taken when the counter is zero; deltas are 0 or +1.
    zero: Vec<Vec<Edge>>,
    /// Transitions taken when the counter is positive.
    positive: Vec<Vec<Edge>>,
}

impl Roca {
    pub fn builder(alphabet: Alphabet, locations: usize) -> RocaBuilder {
        RocaBuilder::new(alphabet, locations)
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn location_count(&self) -> usize {
        self.accepting.len()
    }

    pub fn is_accepting_location(&self, location: usize) -> bool {
        self.accepting[location]
    }

    /// The transition taken from `location` with the given counter status.
    pub fn edge(&self, location: usize, symbol: usize, counter_is_zero: bool) -> Edge {
        let table = if counter_is_zero {
            &self.zero
        } else {
            &self.positive
        };
        table.get(location)?.get(symbol).copied().flatten()
    }

    /// The counter value after reading `word`, when the run survives.
    pub fn counter_value(&self, word: &Word) -> Option<i64> {
        self.run(word).map(|config| config.counter)
    }
}

impl CounterAutomaton for Roca {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn state_count(&self) -> usize {
        self.location_count()
    }

    fn initial(&self) -> Config {
        Config::new(self.initial, 0)
    }

    fn step(&self, config: Config, symbol: usize) -> Option<Config> {
        let (target, delta) = self.edge(config.state, symbol, config.counter == 0)?;
        let counter = config.counter + i64::from(delta);
        debug_assert!(counter >= 0, "validated deltas keep the counter non-negative");
        Some(Config::new(target, counter))
    }

    fn is_accepting(&self, config: Config) -> bool {
        config.counter == 0 && self.accepting[config.state]
    }
}

/// Builder validating location indices and counter deltas.
pub struct RocaBuilder {
    alphabet: Alphabet,
    initial: usize,
    accepting: Vec<bool>,
    zero: Vec<Vec<Edge>>,
    positive: Vec<Vec<Edge>>,
}

impl RocaBuilder {
    pub fn new(alphabet: Alphabet, locations: usize) -> Self {
        let zero = vec![vec![None; alphabet.len()]; locations];
        let positive = zero.clone();
        Self {
            alphabet,
            initial: 0,
            accepting: vec![false; locations],
            zero,
            positive,
        }
    }

    pub fn initial(mut self, location: usize) -> Self {
        self.initial = location;
        self
    }

    pub fn accepting(mut self, location: usize) -> Self {
        self.accepting[location] = true;
        self
    }

    fn symbol_index(&self, symbol: &str) -> Result<usize> {
        self.alphabet
            .index_of(&Symbol::from(symbol))
            .ok_or_else(|| LearnerError::UnknownSymbol {
                symbol: symbol.to_string(),
            })
    }

    /// Transition taken when the counter is zero. `delta` must be 0 or +1.
    pub fn on_zero(mut self, from: usize, symbol: &str, to: usize, delta: i8) -> Result<Self> {
        assert!(
            delta == 0 || delta == 1,
            "zero-test transitions cannot pop the counter"
        );
        let sym = self.symbol_index(symbol)?;
        self.zero[from][sym] = Some((to, delta));
        Ok(self)
    }

    /// Transition taken when the counter is positive. `delta` ∈ {−1, 0, +1}.
    pub fn on_positive(mut self, from: usize, symbol: &str, to: usize, delta: i8) -> Result<Self> {
        assert!((-1..=1).contains(&delta), "deltas are −1, 0 or +1");
        let sym = self.symbol_index(symbol)?;
        self.positive[from][sym] = Some((to, delta));
        Ok(self)
    }

    /// The same transition regardless of the counter status. `delta` must be
    /// 0 or +1 (it also applies at counter zero).
    pub fn on_any(self, from: usize, symbol: &str, to: usize, delta: i8) -> Result<Self> {
        self.on_zero(from, symbol, to, delta)?
            .on_positive(from, symbol, to, delta)
    }

    pub fn build(self) -> Roca {
        assert!(self.initial < self.accepting.len(), "initial location out of range");
        Roca {
            alphabet: self.alphabet,
            initial: self.initial,
            accepting: self.accepting,
            zero: self.zero,
            positive: self.positive,
        }
    }
}

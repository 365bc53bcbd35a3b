use crate::base::{Alphabet, CounterValue, PartitionedAlphabet, Symbol, Word};
use crate::error::{LearnerError, Result};
use crate::oracles::CounterValueOracle;

use super::tree::ObservationTree;
use super::{Cell, CounterValuePropagation};

/// The pluggable half of [`super::ObservationTable`]: everything that
/// differs between the counter-annotated single-table shape and the
/// stratified layered shape, with no dynamic dispatch at the cells.
pub trait TablePolicy {
    /// Stratified tables own one layer per counter value up to the limit;
    /// the single-table shape owns exactly one.
    fn stratified(&self) -> bool;

    /// Whether the policy can handle the symbol (stratified tables must
    /// know its partition class).
    fn supports_symbol(&self, symbol: &Symbol) -> bool;

    /// Words the policy knows to be outside prefix(L) without any oracle
    /// (stratified: the running counter dips below zero).
    fn known_exit(&self, word: &Word) -> bool;

    /// A counter value known without consulting the oracle, or `None` when
    /// PASS B must compute it.
    fn static_counter_value(&self, word: &Word) -> Option<CounterValue>;

    /// The layer owning a row with counter value `cv`; `None` is the sink.
    fn layer_of(&self, cv: CounterValue, limit: i64) -> Option<usize>;

    /// Whether PASS B still has work to do on this cell. Cells with a
    /// definitive value (known counter value, or a word outside prefix(L)
    /// or outside the limit) are skipped.
    fn should_change_counter_value(&self, cell: &Cell) -> bool {
        !cell.outside_limit
            && cell.counter_value.is_unknown()
            && cell
                .output
                .is_some_and(|output| !output.is_exit())
    }

    /// Whether this cell's output could change under a larger counter
    /// limit. Outside-limit cells were never queried, so they are exactly
    /// the ones to re-examine.
    fn should_change_output(&self, cell: &Cell) -> bool {
        cell.outside_limit
    }

    /// PASS B: the counter value of an in-prefix `word`, caching every
    /// value on the observation tree path.
    fn compute_counter_value<C: CounterValueOracle>(
        &self,
        word: &Word,
        alphabet: &Alphabet,
        tree: &mut ObservationTree,
        oracle: &mut C,
        limit: i64,
        propagation: CounterValuePropagation,
    ) -> Result<CounterValue>;
}

/// Policy of the ROCA learner's table: a single layer, counter values
/// obtained from the counter-value oracle through the tree cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct RocaTablePolicy;

impl TablePolicy for RocaTablePolicy {
    fn stratified(&self) -> bool {
        false
    }

    fn supports_symbol(&self, _symbol: &Symbol) -> bool {
        true
    }

    fn known_exit(&self, _word: &Word) -> bool {
        false
    }

    fn static_counter_value(&self, _word: &Word) -> Option<CounterValue> {
        None
    }

    fn layer_of(&self, _cv: CounterValue, _limit: i64) -> Option<usize> {
        Some(0)
    }

    fn compute_counter_value<C: CounterValueOracle>(
        &self,
        word: &Word,
        alphabet: &Alphabet,
        tree: &mut ObservationTree,
        oracle: &mut C,
        limit: i64,
        propagation: CounterValuePropagation,
    ) -> Result<CounterValue> {
        let mut node = tree.root();
        for k in 0..=word.len() {
            if k > 0 {
                let prefix = word.prefix(k);
                node = tree.node_of(&prefix, alphabet)?;
            }
            let cached = tree.counter_value(node);
            let is_cell_word = k == word.len();
            // with propagation enabled a cached value settles the node; the
            // initial fill re-asks for the cell's own word and lets the tree
            // verify the answer against anything already known
            if cached.is_known() && (propagation == CounterValuePropagation::Enabled || !is_cell_word)
            {
                continue;
            }
            let prefix = word.prefix(k);
            let answer = oracle.answer_query(&prefix, &Word::epsilon())?;
            if answer < 0 {
                return Err(LearnerError::disagreement(
                    &prefix,
                    format!("negative counter value {answer}"),
                ));
            }
            tree.set_counter_value(node, CounterValue::known(answer), limit, alphabet)?;
        }
        Ok(tree.counter_value(node))
    }
}

/// Policy of the stratified (visibly one-counter) table: one layer per
/// counter value, values computed from the symbol partition alone.
#[derive(Debug, Clone)]
pub struct VcaTablePolicy {
    partition: PartitionedAlphabet,
}

impl VcaTablePolicy {
    pub fn new(partition: PartitionedAlphabet) -> Self {
        Self { partition }
    }

    pub fn partition(&self) -> &PartitionedAlphabet {
        &self.partition
    }

    /// Running counter of `word`; `None` when the word is ill-matched.
    fn running_value(&self, word: &Word) -> Option<i64> {
        let mut value = 0i64;
        for sym in word.symbols() {
            value += self.partition.delta_of(sym)?;
            if value < 0 {
                return None;
            }
        }
        Some(value)
    }
}

impl TablePolicy for VcaTablePolicy {
    fn stratified(&self) -> bool {
        true
    }

    fn supports_symbol(&self, symbol: &Symbol) -> bool {
        self.partition.class_of(symbol).is_some()
    }

    fn known_exit(&self, word: &Word) -> bool {
        self.running_value(word).is_none()
    }

    fn static_counter_value(&self, word: &Word) -> Option<CounterValue> {
        Some(match self.running_value(word) {
            Some(value) => CounterValue::known(value),
            None => CounterValue::UNKNOWN,
        })
    }

    fn layer_of(&self, cv: CounterValue, limit: i64) -> Option<usize> {
        let value = cv.value()?;
        (value <= limit).then_some(value as usize)
    }

    fn compute_counter_value<C: CounterValueOracle>(
        &self,
        word: &Word,
        alphabet: &Alphabet,
        tree: &mut ObservationTree,
        _oracle: &mut C,
        limit: i64,
        _propagation: CounterValuePropagation,
    ) -> Result<CounterValue> {
        // values are determined by the partition; the walk still caches
        // them on the tree so outside-limit flags stay accurate
        let mut result = CounterValue::UNKNOWN;
        for k in 0..=word.len() {
            let prefix = word.prefix(k);
            let Some(value) = self.running_value(&prefix) else {
                return Ok(CounterValue::UNKNOWN);
            };
            let node = tree.node_of(&prefix, alphabet)?;
            tree.set_counter_value(node, CounterValue::known(value), limit, alphabet)?;
            result = CounterValue::known(value);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::base::SymbolClass;

    use super::*;

    fn vca_policy() -> VcaTablePolicy {
        let mut partition = PartitionedAlphabet::new();
        partition.add(Symbol::from("a"), SymbolClass::Call);
        partition.add(Symbol::from("i"), SymbolClass::Internal);
        partition.add(Symbol::from("b"), SymbolClass::Return);
        VcaTablePolicy::new(partition)
    }

    #[test]
    fn test_vca_static_values() {
        let policy = vca_policy();
        let aib = Word::from_symbols(["a", "i", "b"]);
        assert_eq!(policy.static_counter_value(&aib), Some(CounterValue::known(0)));
        let ill = Word::from_symbols(["b"]);
        assert_eq!(policy.static_counter_value(&ill), Some(CounterValue::UNKNOWN));
        assert!(policy.known_exit(&ill));
    }

    #[test]
    fn test_vca_layer_routing() {
        let policy = vca_policy();
        assert_eq!(policy.layer_of(CounterValue::known(2), 3), Some(2));
        assert_eq!(policy.layer_of(CounterValue::known(4), 3), None);
        assert_eq!(policy.layer_of(CounterValue::UNKNOWN, 3), None);
    }

    #[test]
    fn test_roca_policy_is_single_layer() {
        let policy = RocaTablePolicy;
        assert!(!policy.stratified());
        assert_eq!(policy.layer_of(CounterValue::UNKNOWN, 0), Some(0));
        assert_eq!(policy.layer_of(CounterValue::known(7), 0), Some(0));
    }
}

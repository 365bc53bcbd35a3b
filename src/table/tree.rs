use crate::base::{Alphabet, CounterValue, Word};
use crate::error::{LearnerError, Result};
use crate::oracles::AcceptingOrExit;

/// Identifier of an observation-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<(NodeId, usize)>,
    children: Vec<Option<NodeId>>,
    output: Option<AcceptingOrExit>,
    counter_value: CounterValue,
    in_table: bool,
    /// Confirmed to be in prefix(L).
    in_prefix: bool,
    /// Confirmed to be outside prefix(L) (an ancestor or the node itself
    /// answered Exit).
    dead: bool,
    /// The node's word only occurs under suffixes tagged only-for-language.
    only_for_language: bool,
    /// Some node on the path has a counter value above the current limit.
    outside_limit: bool,
}

impl Node {
    fn new(parent: Option<(NodeId, usize)>, dead: bool, outside_limit: bool) -> Self {
        Self {
            parent,
            children: Vec::new(),
            output: if dead { Some(AcceptingOrExit::Exit) } else { None },
            counter_value: CounterValue::UNKNOWN,
            in_table: false,
            in_prefix: false,
            dead,
            only_for_language: false,
            outside_limit,
        }
    }
}

/// A trie over the input alphabet caching per-word oracle results.
///
/// Every oracle answer enters the table through this tree, so a word is
/// never sent to the membership oracle twice, and the cross-cell invariants
/// (accept ⇒ counter 0; exit and outside-limit are downward closed) are
/// checked at the moment an answer arrives.
#[derive(Debug, Clone)]
pub struct ObservationTree {
    nodes: Vec<Node>,
}

impl ObservationTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(None, false, false)],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::new(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn child(&self, id: NodeId, symbol: usize) -> Option<NodeId> {
        self.node(id).children.get(symbol).copied().flatten()
    }

    /// Child on `symbol`, created on demand. Created nodes inherit the
    /// dead and outside-limit flags of their parent.
    pub fn child_or_create(&mut self, id: NodeId, symbol: usize) -> NodeId {
        if let Some(child) = self.child(id, symbol) {
            return child;
        }
        let (dead, outside) = {
            let node = self.node(id);
            (node.dead, node.outside_limit)
        };
        let child = NodeId::new(self.nodes.len());
        self.nodes.push(Node::new(Some((id, symbol)), dead, outside));
        let children = &mut self.node_mut(id).children;
        if symbol >= children.len() {
            children.resize(symbol + 1, None);
        }
        children[symbol] = Some(child);
        child
    }

    /// The node for `word`, creating the path as needed.
    pub fn node_of(&mut self, word: &Word, alphabet: &Alphabet) -> Result<NodeId> {
        let mut id = self.root();
        for sym in word.symbols() {
            let index = alphabet
                .index_of(sym)
                .ok_or_else(|| LearnerError::UnknownSymbol {
                    symbol: sym.as_str().to_string(),
                })?;
            id = self.child_or_create(id, index);
        }
        Ok(id)
    }

    /// The node for `word` if the whole path exists already.
    pub fn lookup(&self, word: &Word, alphabet: &Alphabet) -> Option<NodeId> {
        let mut id = self.root();
        for sym in word.symbols() {
            id = self.child(id, alphabet.index_of(sym)?)?;
        }
        Some(id)
    }

    pub fn parent(&self, id: NodeId) -> Option<(NodeId, usize)> {
        self.node(id).parent
    }

    /// Reconstruct the word labelling `id`.
    pub fn word_of(&self, id: NodeId, alphabet: &Alphabet) -> Word {
        let mut symbols = Vec::new();
        let mut current = id;
        while let Some((parent, symbol)) = self.node(current).parent {
            symbols.push(alphabet.get(symbol).expect("symbol index in range").clone());
            current = parent;
        }
        symbols.reverse();
        Word::from_symbols(symbols)
    }

    pub fn output(&self, id: NodeId) -> Option<AcceptingOrExit> {
        self.node(id).output
    }

    pub fn counter_value(&self, id: NodeId) -> CounterValue {
        self.node(id).counter_value
    }

    pub fn is_in_prefix(&self, id: NodeId) -> bool {
        self.node(id).in_prefix
    }

    pub fn is_dead(&self, id: NodeId) -> bool {
        self.node(id).dead
    }

    pub fn is_outside_limit(&self, id: NodeId) -> bool {
        self.node(id).outside_limit
    }

    pub fn is_only_for_language(&self, id: NodeId) -> bool {
        self.node(id).only_for_language
    }

    pub fn mark_in_table(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.in_table = true;
        node.only_for_language = false;
    }

    pub fn is_in_table(&self, id: NodeId) -> bool {
        self.node(id).in_table
    }

    /// Tag a node whose word only occurs under an only-for-language suffix.
    /// Regular use of the node clears the tag again.
    pub fn mark_only_for_language(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        if !node.in_table {
            node.only_for_language = true;
        }
    }

    /// Record a membership answer for `id`.
    ///
    /// An accepting or rejecting answer confirms the whole path is in
    /// prefix(L); an exit answer kills the node and its subtree. Answers
    /// contradicting earlier knowledge raise an oracle disagreement.
    pub fn set_output(
        &mut self,
        id: NodeId,
        output: AcceptingOrExit,
        alphabet: &Alphabet,
    ) -> Result<()> {
        if let Some(previous) = self.node(id).output {
            if previous != output {
                let word = self.word_of(id, alphabet);
                return Err(LearnerError::disagreement(
                    &word,
                    format!("membership answer changed from {previous:?} to {output:?}"),
                ));
            }
            return Ok(());
        }
        match output {
            AcceptingOrExit::Accepting | AcceptingOrExit::Rejecting => {
                if self.node(id).dead {
                    let word = self.word_of(id, alphabet);
                    return Err(LearnerError::disagreement(
                        &word,
                        "word answered inside prefix(L) below an exit node",
                    ));
                }
                let node = self.node(id);
                if output == AcceptingOrExit::Accepting
                    && node.counter_value.is_known()
                    && node.counter_value.get() != 0
                    && !node.only_for_language
                {
                    let word = self.word_of(id, alphabet);
                    return Err(LearnerError::disagreement(
                        &word,
                        format!("accepted word with counter value {}", node.counter_value),
                    ));
                }
                self.node_mut(id).output = Some(output);
                // prefix(L) is prefix-closed: the whole path is in it
                let mut current = Some(id);
                while let Some(node) = current {
                    self.node_mut(node).in_prefix = true;
                    current = self.node(node).parent.map(|(p, _)| p);
                }
            }
            AcceptingOrExit::Exit => {
                if self.node(id).in_prefix {
                    let word = self.word_of(id, alphabet);
                    return Err(LearnerError::disagreement(
                        &word,
                        "word answered as exit after being confirmed in prefix(L)",
                    ));
                }
                self.node_mut(id).output = Some(output);
                self.propagate_dead(id);
            }
        }
        Ok(())
    }

    fn propagate_dead(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            self.node_mut(node).dead = true;
            if self.node(node).output.is_none() {
                self.node_mut(node).output = Some(AcceptingOrExit::Exit);
            }
            let children: Vec<_> = self.node(node).children.iter().flatten().copied().collect();
            stack.extend(children);
        }
    }

    /// Record a counter value for `id`, checking accept ⇒ counter 0 and
    /// pushing the outside-limit flag down when the value exceeds `limit`.
    pub fn set_counter_value(
        &mut self,
        id: NodeId,
        value: CounterValue,
        limit: i64,
        alphabet: &Alphabet,
    ) -> Result<()> {
        debug_assert!(value.is_known());
        let node = self.node(id);
        if node.counter_value.is_known() {
            if node.counter_value != value {
                let word = self.word_of(id, alphabet);
                return Err(LearnerError::disagreement(
                    &word,
                    format!(
                        "counter value changed from {} to {}",
                        node.counter_value, value
                    ),
                ));
            }
            return Ok(());
        }
        if node.output == Some(AcceptingOrExit::Accepting)
            && !node.only_for_language
            && value.get() != 0
        {
            let word = self.word_of(id, alphabet);
            return Err(LearnerError::disagreement(
                &word,
                format!("accepted word with counter value {value}"),
            ));
        }
        self.node_mut(id).counter_value = value;
        if value.get() > limit {
            self.propagate_outside(id);
        }
        Ok(())
    }

    fn propagate_outside(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if self.node(node).outside_limit {
                continue;
            }
            self.node_mut(node).outside_limit = true;
            let children: Vec<_> = self.node(node).children.iter().flatten().copied().collect();
            stack.extend(children);
        }
    }

    /// Recompute the outside-limit flags for a (raised) limit.
    pub fn recompute_outside(&mut self, limit: i64) {
        let mut stack = vec![(self.root(), false)];
        while let Some((id, parent_outside)) = stack.pop() {
            let node = self.node(id);
            let outside =
                parent_outside || (node.counter_value.is_known() && node.counter_value.get() > limit);
            self.node_mut(id).outside_limit = outside;
            let children: Vec<_> = self.node(id).children.iter().flatten().copied().collect();
            for child in children {
                stack.push((child, outside));
            }
        }
    }
}

impl Default for ObservationTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Word {
        Word::from_symbols(s.chars())
    }

    fn ab() -> Alphabet {
        Alphabet::from_symbols(["a", "b"])
    }

    #[test]
    fn test_word_reconstruction() {
        let alphabet = ab();
        let mut tree = ObservationTree::new();
        let node = tree.node_of(&w("aba"), &alphabet).unwrap();
        assert_eq!(tree.word_of(node, &alphabet), w("aba"));
        assert_eq!(tree.word_of(tree.root(), &alphabet), Word::epsilon());
    }

    #[test]
    fn test_accepting_marks_path_in_prefix() {
        let alphabet = ab();
        let mut tree = ObservationTree::new();
        let node = tree.node_of(&w("ab"), &alphabet).unwrap();
        tree.set_output(node, AcceptingOrExit::Accepting, &alphabet)
            .unwrap();
        let mid = tree.lookup(&w("a"), &alphabet).unwrap();
        assert!(tree.is_in_prefix(mid));
        assert!(tree.is_in_prefix(tree.root()));
    }

    #[test]
    fn test_exit_is_downward_closed() {
        let alphabet = ab();
        let mut tree = ObservationTree::new();
        let below = tree.node_of(&w("ba"), &alphabet).unwrap();
        let node = tree.lookup(&w("b"), &alphabet).unwrap();
        tree.set_output(node, AcceptingOrExit::Exit, &alphabet).unwrap();
        assert!(tree.is_dead(below));
        assert_eq!(tree.output(below), Some(AcceptingOrExit::Exit));
        // an in-prefix answer below an exit node is a disagreement
        let err = tree.set_output(below, AcceptingOrExit::Rejecting, &alphabet);
        assert!(err.is_err());
    }

    #[test]
    fn test_accept_requires_counter_zero() {
        let alphabet = ab();
        let mut tree = ObservationTree::new();
        let node = tree.node_of(&w("ab"), &alphabet).unwrap();
        tree.set_output(node, AcceptingOrExit::Accepting, &alphabet)
            .unwrap();
        assert!(
            tree.set_counter_value(node, CounterValue::known(1), 5, &alphabet)
                .is_err()
        );
        assert!(
            tree.set_counter_value(node, CounterValue::known(0), 5, &alphabet)
                .is_ok()
        );
    }

    #[test]
    fn test_outside_limit_propagates_and_recomputes() {
        let alphabet = ab();
        let mut tree = ObservationTree::new();
        let deep = tree.node_of(&w("aaa"), &alphabet).unwrap();
        let mid = tree.lookup(&w("aa"), &alphabet).unwrap();
        tree.set_counter_value(mid, CounterValue::known(2), 1, &alphabet)
            .unwrap();
        assert!(tree.is_outside_limit(mid));
        assert!(tree.is_outside_limit(deep));
        tree.recompute_outside(2);
        assert!(!tree.is_outside_limit(mid));
        assert!(!tree.is_outside_limit(deep));
    }
}

use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

use crate::base::{Alphabet, CancellationToken, CounterValue, Symbol, Word};
use crate::error::{LearnerError, Result};
use crate::oracles::{AcceptingOrExit, CounterValueOracle, MembershipOracle, Query};

use super::policy::TablePolicy;
use super::prefix::{PrefixLookup, PrefixTracker};
use super::store::{RowKind, RowStore};
use super::tree::{NodeId, ObservationTree};
use super::{Cell, ContentCell, ContentId, CounterValuePropagation, RowId};

/// Per-suffix bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct SuffixMeta {
    only_for_language: bool,
}

/// One stratum of the table. The single-table shape owns exactly one layer;
/// the stratified shape owns one per counter value up to the limit. Each
/// layer has its own rows, suffix list, content interning and canonical map.
#[derive(Debug, Clone)]
pub struct Layer {
    level: i64,
    short_rows: Vec<RowId>,
    long_rows: Vec<RowId>,
    suffixes: IndexMap<Word, SuffixMeta, FxBuildHasher>,
    contents: super::ContentStore,
    canonical: FxHashMap<ContentId, RowId>,
}

impl Layer {
    fn new(level: i64) -> Self {
        Self {
            level,
            short_rows: Vec::new(),
            long_rows: Vec::new(),
            suffixes: IndexMap::default(),
            contents: super::ContentStore::new(),
            canonical: FxHashMap::default(),
        }
    }

    pub fn level(&self) -> i64 {
        self.level
    }

    pub fn short_rows(&self) -> &[RowId] {
        &self.short_rows
    }

    pub fn long_rows(&self) -> &[RowId] {
        &self.long_rows
    }

    pub fn suffix_count(&self) -> usize {
        self.suffixes.len()
    }

    pub fn suffixes(&self) -> impl Iterator<Item = &Word> + '_ {
        self.suffixes.keys()
    }

    pub fn suffix_at(&self, index: usize) -> Option<&Word> {
        self.suffixes.get_index(index).map(|(word, _)| word)
    }

    pub fn is_only_for_language(&self, index: usize) -> bool {
        self.suffixes
            .get_index(index)
            .is_some_and(|(_, meta)| meta.only_for_language)
    }

    /// The canonical short row of a content class, when one exists.
    pub fn canonical(&self, content: ContentId) -> Option<RowId> {
        self.canonical.get(&content).copied()
    }

    pub fn contents(&self) -> &super::ContentStore {
        &self.contents
    }
}

/// A set of unclosed long rows sharing one content, so the caller can
/// promote a single representative per group.
#[derive(Debug, Clone)]
pub struct UnclosedGroup {
    pub layer: usize,
    pub content: ContentId,
    pub rows: Vec<RowId>,
}

/// All unclosed groups found after an operation.
#[derive(Debug, Clone, Default)]
pub struct UnclosedGroups {
    groups: Vec<UnclosedGroup>,
}

impl UnclosedGroups {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnclosedGroup> + '_ {
        self.groups.iter()
    }
}

/// Two short rows with equal content whose successors on `symbol` differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inconsistency {
    pub layer: usize,
    pub left: RowId,
    pub right: RowId,
    /// Alphabet index of the offending symbol.
    pub symbol: usize,
}

/// The observation table: short and long prefix rows against suffix
/// columns, every cell annotated with a counter value, filled in two passes
/// (membership first, counter values second) through the observation tree.
#[derive(Debug, Clone)]
pub struct ObservationTable<P: TablePolicy> {
    policy: P,
    alphabet: Alphabet,
    rows: RowStore,
    layers: Vec<Layer>,
    tree: ObservationTree,
    tracker: PrefixTracker,
    counter_limit: i64,
    initialized: bool,
    token: CancellationToken,
}

impl<P: TablePolicy> ObservationTable<P> {
    pub fn new(alphabet: Alphabet, policy: P, counter_limit: i64) -> Self {
        assert!(counter_limit >= 0, "counter limits are non-negative");
        let layer_count = if policy.stratified() {
            (counter_limit + 1) as usize
        } else {
            1
        };
        let layers = (0..layer_count).map(|k| Layer::new(k as i64)).collect();
        Self {
            policy,
            alphabet,
            rows: RowStore::new(),
            layers,
            tree: ObservationTree::new(),
            tracker: PrefixTracker::new(),
            counter_limit,
            initialized: false,
            token: CancellationToken::new(),
        }
    }

    /// Observe `token` at fill boundaries.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.token = token;
    }

    // ------------------------------------------------------------------
    // read access
    // ------------------------------------------------------------------

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn counter_limit(&self) -> i64 {
        self.counter_limit
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    pub fn row(&self, id: RowId) -> &super::Row {
        self.rows.get(id)
    }

    pub fn row_by_label(&self, label: &Word) -> Option<RowId> {
        self.rows.by_label(label)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn tracker(&self) -> &PrefixTracker {
        &self.tracker
    }

    pub fn tree(&self) -> &ObservationTree {
        &self.tree
    }

    /// Rows currently sharing `content` within `layer`.
    pub fn rows_by_content(&self, layer: usize, content: ContentId) -> Vec<RowId> {
        let mut rows: Vec<_> = self.layers[layer].contents.members(content).iter().copied().collect();
        rows.sort();
        rows
    }

    /// The canonical short row of the class `row` belongs to.
    pub fn canonical_row(&self, row: RowId) -> Option<RowId> {
        let r = self.rows.get(row);
        self.layers[r.layer()].canonical(r.content()?)
    }

    /// (row count, total suffix count, live content count) - strictly grows
    /// whenever refinement made progress.
    pub fn size_fingerprint(&self) -> (usize, usize, usize) {
        let suffixes = self.layers.iter().map(Layer::suffix_count).sum();
        let contents = self
            .layers
            .iter()
            .map(|layer| layer.contents.live_ids().count())
            .sum();
        (self.rows.len(), suffixes, contents)
    }

    // ------------------------------------------------------------------
    // public operations
    // ------------------------------------------------------------------

    /// Build the initial table: validate the short prefixes, create their
    /// rows and one-symbol extensions, then run the two-pass fill over every
    /// cell in a single batch.
    pub fn initialize<M, C>(
        &mut self,
        initial_short_prefixes: &[Word],
        initial_suffixes: &[Word],
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        if self.initialized {
            return Err(LearnerError::AlreadyInitialized);
        }
        self.check_cancelled()?;
        validate_prefix_closure(initial_short_prefixes)?;
        self.initialized = true;

        let suffixes: Vec<(Word, bool)> = initial_suffixes
            .iter()
            .map(|word| (word.clone(), false))
            .collect();
        self.append_suffixes(&suffixes);

        let mut created = Vec::new();
        for prefix in initial_short_prefixes {
            created.extend(self.ensure_short(prefix)?);
        }
        let pending = self.cells_of(&created);
        tracing::debug!(
            rows = created.len(),
            cells = pending.len(),
            "initializing observation table"
        );
        self.fill_cells(&pending, membership, counter, CounterValuePropagation::Disabled)?;
        self.after_fill()
    }

    /// Add suffix columns. Duplicates are rejected silently; an empty (or
    /// fully duplicate) input is a no-op.
    pub fn add_suffixes<M, C>(
        &mut self,
        suffixes: &[Word],
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        let tagged: Vec<(Word, bool)> = suffixes.iter().map(|w| (w.clone(), false)).collect();
        self.add_suffixes_with(&tagged, membership, counter)
    }

    /// Like [`Self::add_suffixes`], with an only-for-language tag per
    /// suffix. Tagged cells are exempt from the accept ⇒ counter-0 check.
    pub fn add_suffixes_with<M, C>(
        &mut self,
        suffixes: &[(Word, bool)],
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        self.ensure_initialized()?;
        self.check_cancelled()?;
        let pending = self.append_suffixes(suffixes);
        if pending.is_empty() {
            return Ok(self.find_unclosed_rows());
        }
        tracing::debug!(cells = pending.len(), "adding suffix columns");
        self.fill_cells(&pending, membership, counter, CounterValuePropagation::Enabled)?;
        self.after_fill()
    }

    /// Add short prefixes: promote existing long rows or create fresh short
    /// rows (together with any missing ancestors, keeping the short labels
    /// prefix-closed), then materialise missing successors as long rows.
    pub fn add_short_prefixes<M, C>(
        &mut self,
        prefixes: &[Word],
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        self.ensure_initialized()?;
        self.check_cancelled()?;
        let mut created = Vec::new();
        for prefix in prefixes {
            created.extend(self.ensure_short(prefix)?);
        }
        let pending = self.cells_of(&created);
        self.fill_cells(&pending, membership, counter, CounterValuePropagation::Enabled)?;
        self.after_fill()
    }

    /// Promote the given long rows to short rows.
    pub fn promote_to_short<M, C>(
        &mut self,
        rows: &[RowId],
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        let labels: Vec<Word> = rows
            .iter()
            .map(|&id| self.rows.get(id).label().clone())
            .collect();
        self.add_short_prefixes(&labels, membership, counter)
    }

    /// Extend the alphabet by one symbol: every short row gets a long row
    /// for `label · symbol`. Idempotent.
    pub fn add_alphabet_symbol<M, C>(
        &mut self,
        symbol: Symbol,
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        self.ensure_initialized()?;
        self.check_cancelled()?;
        if self.alphabet.contains(&symbol) {
            return Ok(self.find_unclosed_rows());
        }
        if !self.policy.supports_symbol(&symbol) {
            return Err(LearnerError::UnknownSymbol {
                symbol: symbol.as_str().to_string(),
            });
        }
        self.alphabet.add(symbol);
        let symbol_index = self.alphabet.len() - 1;

        let mut created = Vec::new();
        let short_rows: Vec<RowId> = self
            .layers
            .iter()
            .flat_map(|layer| layer.short_rows.iter().copied())
            .collect();
        for row_id in short_rows {
            created.extend(self.link_successor(row_id, symbol_index));
        }
        let pending = self.cells_of(&created);
        self.fill_cells(&pending, membership, counter, CounterValuePropagation::Enabled)?;
        self.after_fill()
    }

    /// Raise the counter limit, re-examining every cell whose output could
    /// change (cells that were outside the old limit were never queried and
    /// are queried now), then add the provided prefixes and suffixes.
    pub fn increase_counter_limit<M, C>(
        &mut self,
        new_limit: i64,
        new_prefixes: &[Word],
        new_suffixes: &[Word],
        membership: &mut M,
        counter: &mut C,
    ) -> Result<UnclosedGroups>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        self.ensure_initialized()?;
        self.check_cancelled()?;
        if new_limit <= self.counter_limit {
            return Err(LearnerError::CounterLimitNotIncreased {
                current: self.counter_limit,
                requested: new_limit,
            });
        }
        tracing::debug!(from = self.counter_limit, to = new_limit, "raising counter limit");
        self.counter_limit = new_limit;
        self.tree.recompute_outside(new_limit);

        if self.policy.stratified() {
            while (self.layers.len() as i64) <= new_limit {
                let level = self.layers.len() as i64;
                let mut layer = Layer::new(level);
                layer.suffixes = self.layers[0].suffixes.clone();
                self.layers.push(layer);
            }
        }

        // re-examine previously masked cells
        let mut pending = Vec::new();
        for index in 0..self.rows.len() {
            let row_id = RowId::new(index);
            let cell_count = self.rows.get(row_id).cells().len();
            for sidx in 0..cell_count {
                let cell = self.rows.get(row_id).cells()[sidx];
                if !self.policy.should_change_output(&cell) {
                    continue;
                }
                let node = self.cell_node(row_id, sidx)?;
                if self.tree.is_outside_limit(node) {
                    continue;
                }
                self.rows.get_mut(row_id).cells[sidx] = Cell::empty();
                pending.push((row_id, sidx));
            }
        }

        // stratified rows may now reach layers that did not exist before
        if self.policy.stratified() {
            let short_rows: Vec<RowId> = self
                .layers
                .iter()
                .flat_map(|layer| layer.short_rows.iter().copied())
                .collect();
            for row_id in short_rows {
                for symbol in 0..self.alphabet.len() {
                    if self.rows.get(row_id).successor(symbol).is_none() {
                        let created = self.link_successor(row_id, symbol);
                        pending.extend(self.cells_of(&created));
                    }
                }
            }
        }

        let tagged: Vec<(Word, bool)> = new_suffixes.iter().map(|w| (w.clone(), false)).collect();
        pending.extend(self.append_suffixes(&tagged));

        let mut created = Vec::new();
        for prefix in new_prefixes {
            created.extend(self.ensure_short(prefix)?);
        }
        pending.extend(self.cells_of(&created));

        self.fill_cells(&pending, membership, counter, CounterValuePropagation::Enabled)?;
        self.refresh_outside_flags();
        self.refresh_row_counter_values();
        let all_rows: Vec<RowId> = (0..self.rows.len()).map(RowId::new).collect();
        self.recompute_contents(&all_rows);
        self.update_canonical();
        Ok(self.find_unclosed_rows())
    }

    // ------------------------------------------------------------------
    // closure, consistency, access sequences
    // ------------------------------------------------------------------

    /// Long rows whose content has no short representative, grouped by
    /// content so the caller can promote one row per group.
    pub fn find_unclosed_rows(&self) -> UnclosedGroups {
        let mut groups = Vec::new();
        for (layer_index, layer) in self.layers.iter().enumerate() {
            let mut by_content: IndexMap<ContentId, Vec<RowId>, FxBuildHasher> = IndexMap::default();
            for &long in &layer.long_rows {
                let Some(content) = self.rows.get(long).content() else {
                    continue;
                };
                if layer.canonical.contains_key(&content) {
                    continue;
                }
                by_content.entry(content).or_default().push(long);
            }
            groups.extend(by_content.into_iter().map(|(content, rows)| UnclosedGroup {
                layer: layer_index,
                content,
                rows,
            }));
        }
        UnclosedGroups { groups }
    }

    /// The first unclosed row, if any.
    pub fn find_unclosed_row(&self) -> Option<RowId> {
        self.find_unclosed_rows().groups.first().map(|g| g.rows[0])
    }

    /// Two equal-content short rows with diverging successors.
    pub fn find_inconsistency(&self) -> Option<Inconsistency> {
        for (layer_index, layer) in self.layers.iter().enumerate() {
            let mut representative: FxHashMap<ContentId, RowId> = FxHashMap::default();
            for &row_id in &layer.short_rows {
                let Some(content) = self.rows.get(row_id).content() else {
                    continue;
                };
                match representative.get(&content) {
                    None => {
                        representative.insert(content, row_id);
                    }
                    Some(&left) => {
                        for symbol in 0..self.alphabet.len() {
                            if !self.successors_agree(left, row_id, symbol) {
                                return Some(Inconsistency {
                                    layer: layer_index,
                                    left,
                                    right: row_id,
                                    symbol,
                                });
                            }
                        }
                    }
                }
            }
        }
        None
    }

    /// The suffix `a · d` resolving `inconsistency`, where `d` separates the
    /// two successors' contents.
    pub fn distinguishing_suffix(&self, inconsistency: &Inconsistency) -> Option<Word> {
        let left = self.rows.get(inconsistency.left).successor(inconsistency.symbol);
        let right = self.rows.get(inconsistency.right).successor(inconsistency.symbol);
        let target_layer = left
            .or(right)
            .map(|row| self.rows.get(row).layer())
            .unwrap_or(0);
        let layer = &self.layers[target_layer];
        let suffix_count = layer.suffix_count();
        for index in 0..suffix_count {
            let l = self.successor_entry(left, index);
            let r = self.successor_entry(right, index);
            if l != r {
                let symbol = self
                    .alphabet
                    .get(inconsistency.symbol)
                    .expect("symbol index in range")
                    .clone();
                let d = layer.suffix_at(index).expect("suffix index in range").clone();
                return Some(Word::from_symbols([symbol]).concat(&d));
            }
        }
        None
    }

    /// Rewrite `word` into the canonical short-prefix word reaching the
    /// same class, following canonical successors symbol by symbol. `None`
    /// when the walk falls into the sink or an unclosed class.
    pub fn transform_access_sequence(&self, word: &Word) -> Option<Word> {
        let mut row_id = self.rows.by_label(&Word::epsilon())?;
        for sym in word.symbols() {
            let symbol = self.alphabet.index_of(sym)?;
            let successor = self.rows.get(row_id).successor(symbol)?;
            let successor_row = self.rows.get(successor);
            row_id = if successor_row.is_short() {
                successor
            } else {
                self.canonical_row(successor)?
            };
        }
        Some(self.rows.get(row_id).label().clone())
    }

    // ------------------------------------------------------------------
    // invariants
    // ------------------------------------------------------------------

    /// Verify every table invariant; the first violation is reported as an
    /// oracle-disagreement-style error.
    pub fn check_invariants(&self) -> Result<()> {
        self.check_prefix_closure()?;
        self.check_cells()?;
        self.check_contents()?;
        self.check_canonicality()?;
        self.check_successor_linkage()?;
        self.check_tree_monotonicity()
    }

    fn violation(word: &Word, detail: impl Into<String>) -> LearnerError {
        LearnerError::disagreement(word, detail)
    }

    fn check_prefix_closure(&self) -> Result<()> {
        let labels: FxHashSet<&Word> = self
            .layers
            .iter()
            .flat_map(|layer| layer.short_rows.iter())
            .map(|&id| self.rows.get(id).label())
            .collect();
        if !labels.contains(&Word::epsilon()) {
            return Err(Self::violation(&Word::epsilon(), "ε is not a short prefix"));
        }
        for label in &labels {
            for k in 0..label.len() {
                let prefix = label.prefix(k);
                if !labels.contains(&prefix) {
                    return Err(Self::violation(
                        label,
                        format!("short prefixes are not prefix-closed (missing {prefix})"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_cells(&self) -> Result<()> {
        for row in self.rows.iter() {
            let layer = &self.layers[row.layer()];
            if row.cells().len() != layer.suffix_count() {
                return Err(Self::violation(row.label(), "row has missing cells"));
            }
            for (index, cell) in row.cells().iter().enumerate() {
                let suffix = layer.suffix_at(index).expect("suffix index in range");
                let word = row.label().concat(suffix);
                if cell.output.is_none() && !cell.outside_limit {
                    return Err(Self::violation(&word, "cell has no defined output"));
                }
                match cell.output {
                    Some(AcceptingOrExit::Exit) => {
                        if cell.counter_value.is_known() {
                            return Err(Self::violation(
                                &word,
                                "exit cell carries a counter value",
                            ));
                        }
                        if self.tracker.lookup(&word, &self.alphabet) == PrefixLookup::True {
                            return Err(Self::violation(
                                &word,
                                "exit cell for a word the tracker holds in prefix(L)",
                            ));
                        }
                    }
                    Some(output) => {
                        if !cell.outside_limit && cell.counter_value.is_unknown() {
                            return Err(Self::violation(
                                &word,
                                "in-prefix cell without a counter value",
                            ));
                        }
                        if cell.counter_value.is_known()
                            && self.tracker.lookup(&word, &self.alphabet) == PrefixLookup::False
                        {
                            return Err(Self::violation(
                                &word,
                                "counter value for a word the tracker excludes from prefix(L)",
                            ));
                        }
                        if output == AcceptingOrExit::Accepting
                            && !layer.is_only_for_language(index)
                            && cell.counter_value.is_known()
                            && cell.counter_value.get() != 0
                        {
                            return Err(Self::violation(
                                &word,
                                "accepted cell with non-zero counter value",
                            ));
                        }
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    fn check_contents(&self) -> Result<()> {
        for row in self.rows.iter() {
            let Some(content) = row.content() else {
                return Err(Self::violation(row.label(), "row has no content id"));
            };
            let layer = &self.layers[row.layer()];
            let derived: Arc<[ContentCell]> = row.cells().iter().map(Cell::content).collect();
            let stored = layer
                .contents
                .sequence(content)
                .ok_or_else(|| Self::violation(row.label(), "row references a freed content id"))?;
            if **stored != *derived {
                return Err(Self::violation(
                    row.label(),
                    "row content id does not match its cells",
                ));
            }
        }
        for layer in &self.layers {
            let mut seen: FxHashSet<&Arc<[ContentCell]>> = FxHashSet::default();
            for id in layer.contents.live_ids() {
                let seq = layer.contents.sequence(id).expect("live id has a sequence");
                if !seen.insert(seq) {
                    return Err(Self::violation(
                        &Word::epsilon(),
                        "two live content ids share one sequence",
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_canonicality(&self) -> Result<()> {
        for layer in &self.layers {
            for &short in &layer.short_rows {
                let Some(content) = self.rows.get(short).content() else {
                    return Err(Self::violation(
                        self.rows.get(short).label(),
                        "short row has no content id",
                    ));
                };
                let canonical = layer.canonical(content).ok_or_else(|| {
                    Self::violation(self.rows.get(short).label(), "class has no canonical row")
                })?;
                let expected = layer
                    .short_rows
                    .iter()
                    .copied()
                    .filter(|&id| self.rows.get(id).content() == Some(content))
                    .min()
                    .expect("at least this short row");
                if canonical != expected {
                    return Err(Self::violation(
                        self.rows.get(short).label(),
                        "canonical row is not the deterministic representative",
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_successor_linkage(&self) -> Result<()> {
        for layer in &self.layers {
            for &short in &layer.short_rows {
                let row = self.rows.get(short);
                for symbol in 0..self.alphabet.len() {
                    let Some(successor) = row.successor(symbol) else {
                        if !self.policy.stratified() {
                            return Err(Self::violation(
                                row.label(),
                                "short row lacks a successor",
                            ));
                        }
                        continue;
                    };
                    let expected = row
                        .label()
                        .append(self.alphabet.get(symbol).expect("in range").clone());
                    if *self.rows.get(successor).label() != expected {
                        return Err(Self::violation(row.label(), "successor label mismatch"));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_tree_monotonicity(&self) -> Result<()> {
        for index in 0..self.tree.len() {
            let node = NodeId::new(index);
            let Some((parent, _)) = self.tree.parent(node) else {
                continue;
            };
            if self.tree.is_outside_limit(parent) && !self.tree.is_outside_limit(node) {
                let word = self.tree.word_of(node, &self.alphabet);
                return Err(Self::violation(&word, "outside-limit is not downward closed"));
            }
            if self.tree.is_dead(parent) && !self.tree.is_dead(node) {
                let word = self.tree.word_of(node, &self.alphabet);
                return Err(Self::violation(&word, "exit is not downward closed"));
            }
            if self.tree.is_in_prefix(node) && !self.tree.is_in_prefix(parent) {
                let word = self.tree.word_of(node, &self.alphabet);
                return Err(Self::violation(&word, "in-prefix is not upward closed"));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(LearnerError::NotInitialized)
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(LearnerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The layer a row labelled `word` belongs to; `None` is the sink.
    fn route_layer(&self, word: &Word) -> Option<usize> {
        let cv = self
            .policy
            .static_counter_value(word)
            .unwrap_or(CounterValue::UNKNOWN);
        self.policy
            .layer_of(cv, self.counter_limit)
            .filter(|&layer| layer < self.layers.len())
    }

    fn create_row(&mut self, label: Word, layer: usize, short: bool) -> Result<RowId> {
        let kind = if short {
            RowKind::Short {
                successors: vec![None; self.alphabet.len()],
            }
        } else {
            RowKind::Long {
                index: self.layers[layer].long_rows.len(),
            }
        };
        let id = self.rows.create(label.clone(), layer, kind);
        let suffix_count = self.layers[layer].suffix_count();
        self.rows.get_mut(id).cells = vec![Cell::empty(); suffix_count];
        if short {
            self.layers[layer].short_rows.push(id);
        } else {
            self.layers[layer].long_rows.push(id);
        }
        let node = self.tree.node_of(&label, &self.alphabet)?;
        self.tree.mark_in_table(node);
        Ok(id)
    }

    /// Make the row for `word` short, creating or promoting it and every
    /// ancestor as needed. Returns the rows created along the way.
    fn ensure_short(&mut self, word: &Word) -> Result<Vec<RowId>> {
        let mut created = Vec::new();
        for k in 0..=word.len() {
            let prefix = word.prefix(k);
            match self.rows.by_label(&prefix) {
                Some(id) if self.rows.get(id).is_short() => {}
                Some(id) => {
                    self.promote_row(id);
                    created.extend(self.link_successors(id));
                }
                None => {
                    let Some(layer) = self.route_layer(&prefix) else {
                        // a sink ancestor would break prefix-closure below it
                        tracing::debug!(word = %prefix, "prefix routes to the sink, skipped");
                        break;
                    };
                    let id = self.create_row(prefix, layer, true)?;
                    created.push(id);
                    created.extend(self.link_successors(id));
                }
            }
        }
        Ok(created)
    }

    /// Swap-remove a long row from its list and re-seat it as a short row.
    fn promote_row(&mut self, id: RowId) {
        let layer_index = self.rows.get(id).layer();
        let long_index = self
            .rows
            .get(id)
            .long_index()
            .expect("only long rows are promoted");
        let list = &mut self.layers[layer_index].long_rows;
        list.swap_remove(long_index);
        if long_index < list.len() {
            let moved = list[long_index];
            self.rows.get_mut(moved).set_long_index(long_index);
        }
        self.rows.get_mut(id).make_short(self.alphabet.len());
        self.layers[layer_index].short_rows.push(id);
        tracing::trace!(label = %self.rows.get(id).label(), "promoted to short");
    }

    fn link_successors(&mut self, id: RowId) -> Vec<RowId> {
        let mut created = Vec::new();
        for symbol in 0..self.alphabet.len() {
            created.extend(self.link_successor(id, symbol));
        }
        created
    }

    fn link_successor(&mut self, id: RowId, symbol: usize) -> Vec<RowId> {
        let label = self.rows.get(id).label().clone();
        let word = label.append(self.alphabet.get(symbol).expect("in range").clone());
        let mut created = Vec::new();
        let target = match self.rows.by_label(&word) {
            Some(existing) => Some(existing),
            None => match self.route_layer(&word) {
                Some(layer) => {
                    let target = self
                        .create_row(word, layer, false)
                        .expect("successor symbols are in the alphabet");
                    created.push(target);
                    Some(target)
                }
                None => None,
            },
        };
        self.rows.get_mut(id).set_successor(symbol, target);
        created
    }

    /// Append suffixes to every layer, extending all existing rows' cell
    /// vectors. Returns the pending (row, column) pairs.
    fn append_suffixes(&mut self, suffixes: &[(Word, bool)]) -> Vec<(RowId, usize)> {
        let mut pending = Vec::new();
        for layer_index in 0..self.layers.len() {
            let mut new_indices = Vec::new();
            for (word, only_for_language) in suffixes {
                let layer = &mut self.layers[layer_index];
                if layer.suffixes.contains_key(word) {
                    continue;
                }
                layer.suffixes.insert(
                    word.clone(),
                    SuffixMeta {
                        only_for_language: *only_for_language,
                    },
                );
                new_indices.push(layer.suffixes.len() - 1);
            }
            if new_indices.is_empty() {
                continue;
            }
            let rows: Vec<RowId> = self.layers[layer_index]
                .short_rows
                .iter()
                .chain(self.layers[layer_index].long_rows.iter())
                .copied()
                .collect();
            for row_id in rows {
                for &index in &new_indices {
                    self.rows.get_mut(row_id).cells.push(Cell::empty());
                    debug_assert_eq!(self.rows.get(row_id).cells().len(), index + 1);
                    pending.push((row_id, index));
                }
            }
        }
        pending
    }

    /// All (row, column) pairs of the given rows.
    fn cells_of(&self, rows: &[RowId]) -> Vec<(RowId, usize)> {
        let mut pending = Vec::new();
        for &row_id in rows {
            let row = self.rows.get(row_id);
            let count = self.layers[row.layer()].suffix_count();
            for index in 0..count {
                pending.push((row_id, index));
            }
        }
        pending
    }

    fn suffix_word(&self, layer: usize, index: usize) -> (Word, bool) {
        let layer = &self.layers[layer];
        let (word, meta) = layer.suffixes.get_index(index).expect("suffix index in range");
        (word.clone(), meta.only_for_language)
    }

    fn cell_node(&mut self, row_id: RowId, index: usize) -> Result<NodeId> {
        let (label, layer) = {
            let row = self.rows.get(row_id);
            (row.label().clone(), row.layer())
        };
        let (suffix, _) = self.suffix_word(layer, index);
        let word = label.concat(&suffix);
        self.tree.node_of(&word, &self.alphabet)
    }

    /// The two-pass fill: PASS A batches every missing membership answer
    /// through the observation tree; PASS B computes counter values per the
    /// policy. Cells outside the counter limit are never queried.
    fn fill_cells<M, C>(
        &mut self,
        pending: &[(RowId, usize)],
        membership: &mut M,
        counter: &mut C,
        propagation: CounterValuePropagation,
    ) -> Result<()>
    where
        M: MembershipOracle<Output = AcceptingOrExit>,
        C: CounterValueOracle,
    {
        // PASS A: membership. Several cells may denote one word (different
        // prefix/suffix splits); each word is sent to the oracle once.
        let mut nodes = Vec::with_capacity(pending.len());
        let mut queries = Vec::new();
        let mut query_nodes: Vec<NodeId> = Vec::new();
        let mut query_targets: Vec<Vec<(RowId, usize)>> = Vec::new();
        let mut query_index: FxHashMap<NodeId, usize> = FxHashMap::default();
        for &(row_id, index) in pending {
            let (label, layer) = {
                let row = self.rows.get(row_id);
                (row.label().clone(), row.layer())
            };
            let (suffix, only_for_language) = self.suffix_word(layer, index);
            let word = label.concat(&suffix);
            let node = self.tree.node_of(&word, &self.alphabet)?;
            nodes.push(node);
            if only_for_language {
                self.tree.mark_only_for_language(node);
            }
            if self.tree.output(node).is_none() && self.policy.known_exit(&word) {
                self.tree.set_output(node, AcceptingOrExit::Exit, &self.alphabet)?;
                self.tracker.mark_absent(&word, &self.alphabet)?;
            }
            let cached = self.tree.output(node);
            let outside = self.tree.is_outside_limit(node);
            let cell = &mut self.rows.get_mut(row_id).cells[index];
            cell.outside_limit = outside;
            match cached {
                Some(output) => cell.output = Some(output),
                None if outside => cell.output = None,
                None => match query_index.get(&node) {
                    Some(&existing) => query_targets[existing].push((row_id, index)),
                    None => {
                        query_index.insert(node, queries.len());
                        queries.push(Query::new(label, suffix));
                        query_nodes.push(node);
                        query_targets.push(vec![(row_id, index)]);
                    }
                },
            }
        }

        if !queries.is_empty() {
            tracing::trace!(count = queries.len(), "dispatching membership batch");
            membership.process_queries(&mut queries);
            for (index, query) in queries.iter().enumerate() {
                let word = query.word();
                let output = *query.output().ok_or_else(|| {
                    LearnerError::disagreement(&word, "membership oracle left a query unanswered")
                })?;
                self.tree.set_output(query_nodes[index], output, &self.alphabet)?;
                match output {
                    AcceptingOrExit::Accepting | AcceptingOrExit::Rejecting => {
                        self.tracker.insert(&word, &self.alphabet)?;
                    }
                    AcceptingOrExit::Exit => {
                        self.tracker.mark_absent(&word, &self.alphabet)?;
                    }
                }
                for &(row_id, cell_index) in &query_targets[index] {
                    self.rows.get_mut(row_id).cells[cell_index].output = Some(output);
                }
            }
        }

        // PASS B: counter values
        for (i, &(row_id, index)) in pending.iter().enumerate() {
            let cell = self.rows.get(row_id).cells()[index];
            if !self.policy.should_change_counter_value(&cell) {
                continue;
            }
            let node = nodes[i];
            let word = self.tree.word_of(node, &self.alphabet);
            let value = self.policy.compute_counter_value(
                &word,
                &self.alphabet,
                &mut self.tree,
                counter,
                self.counter_limit,
                propagation,
            )?;
            self.rows.get_mut(row_id).cells[index].counter_value = value;
        }

        // counter values may have pushed nodes outside the limit
        for (i, &(row_id, index)) in pending.iter().enumerate() {
            let node = nodes[i];
            let outside = self.tree.is_outside_limit(node);
            let cached = self.tree.counter_value(node);
            let cell = &mut self.rows.get_mut(row_id).cells[index];
            cell.outside_limit = outside;
            if cell.counter_value.is_unknown() && cached.is_known() {
                cell.counter_value = cached;
            }
        }
        Ok(())
    }

    fn refresh_outside_flags(&mut self) {
        for index in 0..self.rows.len() {
            let row_id = RowId::new(index);
            let cell_count = self.rows.get(row_id).cells().len();
            for sidx in 0..cell_count {
                if let Ok(node) = self.cell_node(row_id, sidx) {
                    let outside = self.tree.is_outside_limit(node);
                    self.rows.get_mut(row_id).cells[sidx].outside_limit = outside;
                }
            }
        }
    }

    fn refresh_row_counter_values(&mut self) {
        for index in 0..self.rows.len() {
            let row_id = RowId::new(index);
            let label = self.rows.get(row_id).label().clone();
            if let Some(node) = self.tree.lookup(&label, &self.alphabet) {
                let value = self.tree.counter_value(node);
                self.rows.get_mut(row_id).counter_value = value;
            }
        }
    }

    fn recompute_contents(&mut self, rows: &[RowId]) {
        for &row_id in rows {
            let (layer, previous, sequence) = {
                let row = self.rows.get(row_id);
                let sequence: Arc<[ContentCell]> = row.cells().iter().map(Cell::content).collect();
                (row.layer(), row.content(), sequence)
            };
            let (content, _) = self.layers[layer].contents.assign(row_id, sequence, previous);
            self.rows.set_content(row_id, Some(content));
        }
    }

    fn update_canonical(&mut self) {
        for layer_index in 0..self.layers.len() {
            let short = self.layers[layer_index].short_rows.clone();
            let mut canonical: FxHashMap<ContentId, RowId> = FxHashMap::default();
            for row_id in short {
                let Some(content) = self.rows.get(row_id).content() else {
                    continue;
                };
                canonical
                    .entry(content)
                    .and_modify(|current| {
                        if row_id < *current {
                            *current = row_id;
                        }
                    })
                    .or_insert(row_id);
            }
            self.layers[layer_index].canonical = canonical;
        }
    }

    /// Common tail of every mutating operation: refresh annotations,
    /// re-intern contents, rebuild canonical maps, report unclosed rows.
    fn after_fill(&mut self) -> Result<UnclosedGroups> {
        self.refresh_row_counter_values();
        let all_rows: Vec<RowId> = (0..self.rows.len()).map(RowId::new).collect();
        self.recompute_contents(&all_rows);
        self.update_canonical();
        Ok(self.find_unclosed_rows())
    }

    fn successors_agree(&self, left: RowId, right: RowId, symbol: usize) -> bool {
        let l = self.rows.get(left).successor(symbol);
        let r = self.rows.get(right).successor(symbol);
        match (l, r) {
            (None, None) => true,
            (Some(a), Some(b)) => self.rows.get(a).content() == self.rows.get(b).content(),
            (Some(a), None) | (None, Some(a)) => self.content_is_all_sink(a),
        }
    }

    fn content_is_all_sink(&self, row: RowId) -> bool {
        self.rows
            .get(row)
            .cells()
            .iter()
            .all(|cell| cell.content() == ContentCell::SINK)
    }

    fn successor_entry(&self, successor: Option<RowId>, index: usize) -> ContentCell {
        match successor {
            Some(row) => self
                .rows
                .get(row)
                .cells()
                .get(index)
                .map(Cell::content)
                .unwrap_or(ContentCell::SINK),
            None => ContentCell::SINK,
        }
    }
}

fn validate_prefix_closure(prefixes: &[Word]) -> Result<()> {
    let Some(first) = prefixes.first() else {
        return Err(LearnerError::InvalidInitialPrefixes);
    };
    if !first.is_empty() {
        return Err(LearnerError::InvalidInitialPrefixes);
    }
    let set: FxHashSet<&Word> = prefixes.iter().collect();
    for word in prefixes {
        for k in 0..word.len() {
            if !set.contains(&word.prefix(k)) {
                return Err(LearnerError::InvalidInitialPrefixes);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::automata::Roca;
    use crate::oracles::RocaSimulator;
    use crate::table::RocaTablePolicy;

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

    fn table_at(limit: i64) -> (ObservationTable<RocaTablePolicy>, RocaSimulator, RocaSimulator) {
        let table = ObservationTable::new(Alphabet::from_symbols(["a", "b"]), RocaTablePolicy, limit);
        (table, RocaSimulator::new(anbn()), RocaSimulator::new(anbn()))
    }

    #[test]
    fn test_initialize_twice_is_a_contract_violation() {
        let (mut table, mut m, mut c) = table_at(0);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        let err = table.initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c);
        assert!(matches!(err, Err(LearnerError::AlreadyInitialized)));
    }

    #[test]
    fn test_initial_prefixes_must_be_prefix_closed() {
        let (mut table, mut m, mut c) = table_at(0);
        let err = table.initialize(&[Word::epsilon(), w("ab")], &[Word::epsilon()], &mut m, &mut c);
        assert!(matches!(err, Err(LearnerError::InvalidInitialPrefixes)));

        let (mut table, mut m, mut c) = table_at(0);
        let err = table.initialize(&[w("a")], &[Word::epsilon()], &mut m, &mut c);
        assert!(matches!(err, Err(LearnerError::InvalidInitialPrefixes)));
    }

    #[test]
    fn test_operations_before_initialize_are_rejected() {
        let (mut table, mut m, mut c) = table_at(0);
        let err = table.add_suffixes(&[w("a")], &mut m, &mut c);
        assert!(matches!(err, Err(LearnerError::NotInitialized)));
    }

    #[test]
    fn test_initialize_fills_and_reports_unclosed_rows() {
        let (mut table, mut m, mut c) = table_at(0);
        let unclosed = table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        // at limit 0 both one-symbol extensions are sink rows with no short
        // representative
        assert_eq!(unclosed.len(), 1);
        table.check_invariants().unwrap();

        let promote: Vec<RowId> = unclosed.iter().map(|g| g.rows[0]).collect();
        let unclosed = table.promote_to_short(&promote, &mut m, &mut c).unwrap();
        assert!(unclosed.is_empty());
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_epsilon_cell_is_accepting_with_counter_zero() {
        let (mut table, mut m, mut c) = table_at(0);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        let row = table.row_by_label(&Word::epsilon()).unwrap();
        let cell = table.row(row).cells()[0];
        assert_eq!(cell.output, Some(AcceptingOrExit::Accepting));
        assert_eq!(cell.counter_value, CounterValue::known(0));
    }

    #[test]
    fn test_counter_limit_must_increase() {
        let (mut table, mut m, mut c) = table_at(1);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        let err = table.increase_counter_limit(1, &[], &[], &mut m, &mut c);
        assert!(matches!(
            err,
            Err(LearnerError::CounterLimitNotIncreased { current: 1, requested: 1 })
        ));
    }

    #[test]
    fn test_raising_the_limit_unmasks_cells() {
        let (mut table, mut m, mut c) = table_at(0);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        // `a` is in prefix(L) but its counter value 1 lies outside limit 0
        let a = table.row_by_label(&w("a")).unwrap();
        assert_eq!(table.row(a).cells()[0].content(), ContentCell::SINK);

        table
            .increase_counter_limit(1, &[], &[], &mut m, &mut c)
            .unwrap();
        let cell = table.row(a).cells()[0];
        assert_eq!(cell.output, Some(AcceptingOrExit::Rejecting));
        assert_eq!(cell.counter_value, CounterValue::known(1));
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_duplicate_suffixes_are_a_no_op() {
        let (mut table, mut m, mut c) = table_at(1);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        table.add_suffixes(&[w("b")], &mut m, &mut c).unwrap();
        let before = table.size_fingerprint();
        table.add_suffixes(&[w("b")], &mut m, &mut c).unwrap();
        assert_eq!(table.size_fingerprint(), before);
    }

    #[test]
    fn test_add_alphabet_symbol_is_idempotent() {
        let (mut table, mut m, mut c) = table_at(0);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        let before = table.size_fingerprint();
        table
            .add_alphabet_symbol(crate::base::Symbol::from("a"), &mut m, &mut c)
            .unwrap();
        assert_eq!(table.size_fingerprint(), before);
    }

    #[test]
    fn test_transform_access_sequence_follows_canonical_rows() {
        let (mut table, mut m, mut c) = table_at(2);
        let unclosed = table
            .initialize(&[Word::epsilon(), w("a")], &[Word::epsilon(), w("b")], &mut m, &mut c)
            .unwrap();
        let mut unclosed = unclosed;
        while !unclosed.is_empty() {
            let promote: Vec<RowId> = unclosed.iter().map(|g| g.rows[0]).collect();
            unclosed = table.promote_to_short(&promote, &mut m, &mut c).unwrap();
        }
        // `ab` reaches the same class as ε
        let transformed = table.transform_access_sequence(&w("ab")).unwrap();
        let eps_row = table.row_by_label(&Word::epsilon()).unwrap();
        let ab_row = table.row_by_label(&w("ab")).unwrap();
        if table.row(ab_row).content() == table.row(eps_row).content() {
            assert_eq!(transformed, Word::epsilon());
        }
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_cancellation_leaves_table_untouched() {
        let (mut table, mut m, mut c) = table_at(0);
        table
            .initialize(&[Word::epsilon()], &[Word::epsilon()], &mut m, &mut c)
            .unwrap();
        let before = table.size_fingerprint();
        let token = CancellationToken::new();
        table.set_cancellation(token.clone());
        token.cancel();
        let err = table.add_suffixes(&[w("bb")], &mut m, &mut c);
        assert!(matches!(err, Err(LearnerError::Cancelled)));
        assert_eq!(table.size_fingerprint(), before);
    }
}

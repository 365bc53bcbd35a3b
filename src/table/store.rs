use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::base::{CounterValue, Word};

use super::{Cell, ContentCell, ContentId, RowId};

/// Whether a row represents an equivalence class (short prefix) or merely
/// witnesses a transition target (long prefix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKind {
    Short {
        /// Per-symbol successor rows, aligned with alphabet indices.
        /// `None` is the sink (stratified tables only).
        successors: Vec<Option<RowId>>,
    },
    Long {
        /// Position in the owning layer's long-row list, maintained under
        /// swap-removal.
        index: usize,
    },
}

/// A table row: a labelled word with its cells and interned content.
#[derive(Debug, Clone)]
pub struct Row {
    id: RowId,
    label: Word,
    layer: usize,
    kind: RowKind,
    content: Option<ContentId>,
    /// Cells aligned with the owning layer's suffix order.
    pub(super) cells: Vec<Cell>,
    /// Counter value of the label word itself.
    pub(super) counter_value: CounterValue,
}

impl Row {
    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn label(&self) -> &Word {
        &self.label
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn is_short(&self) -> bool {
        matches!(self.kind, RowKind::Short { .. })
    }

    pub fn content(&self) -> Option<ContentId> {
        self.content
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Counter value of the label word; UNKNOWN while unfilled or outside
    /// prefix(L).
    pub fn counter_value(&self) -> CounterValue {
        self.counter_value
    }

    /// Successor row on the symbol with the given alphabet index.
    ///
    /// # Panics
    /// Panics if the row is long (only short rows carry successors).
    pub fn successor(&self, symbol: usize) -> Option<RowId> {
        match &self.kind {
            RowKind::Short { successors } => successors.get(symbol).copied().flatten(),
            RowKind::Long { .. } => panic!("long rows have no successor table"),
        }
    }

    pub(super) fn long_index(&self) -> Option<usize> {
        match self.kind {
            RowKind::Long { index } => Some(index),
            RowKind::Short { .. } => None,
        }
    }

    pub(super) fn set_long_index(&mut self, index: usize) {
        debug_assert!(!self.is_short());
        self.kind = RowKind::Long { index };
    }

    pub(super) fn set_successor(&mut self, symbol: usize, target: Option<RowId>) {
        let RowKind::Short { successors } = &mut self.kind else {
            panic!("long rows have no successor table");
        };
        if symbol >= successors.len() {
            successors.resize(symbol + 1, None);
        }
        successors[symbol] = target;
    }

    /// Turn a long row into a short one with an empty successor table.
    pub(super) fn make_short(&mut self, alphabet_len: usize) {
        debug_assert!(!self.is_short());
        self.kind = RowKind::Short {
            successors: vec![None; alphabet_len],
        };
    }
}

/// Arena of rows, keyed by label.
#[derive(Debug, Clone, Default)]
pub struct RowStore {
    rows: Vec<Row>,
    by_label: FxHashMap<Word, RowId>,
}

impl RowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh row. The label must be unused.
    pub fn create(&mut self, label: Word, layer: usize, kind: RowKind) -> RowId {
        debug_assert!(!self.by_label.contains_key(&label), "label already has a row");
        let id = RowId::new(self.rows.len());
        self.by_label.insert(label.clone(), id);
        self.rows.push(Row {
            id,
            label,
            layer,
            kind,
            content: None,
            cells: Vec::new(),
            counter_value: CounterValue::UNKNOWN,
        });
        id
    }

    pub fn get(&self, id: RowId) -> &Row {
        &self.rows[id.index()]
    }

    pub fn get_mut(&mut self, id: RowId) -> &mut Row {
        &mut self.rows[id.index()]
    }

    pub fn by_label(&self, label: &Word) -> Option<RowId> {
        self.by_label.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> + '_ {
        self.rows.iter()
    }

    pub(super) fn set_content(&mut self, id: RowId, content: Option<ContentId>) {
        self.rows[id.index()].content = content;
    }
}

/// Interning store for row contents.
///
/// Contents are interned by structural equality; ids are reference-counted
/// through the member sets and recycled through a free-list once the last
/// referencing row moves away.
#[derive(Debug, Clone, Default)]
pub struct ContentStore {
    ids: FxHashMap<Arc<[ContentCell]>, ContentId>,
    seqs: Vec<Option<Arc<[ContentCell]>>>,
    members: Vec<FxHashSet<RowId>>,
    free: Vec<ContentId>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `row` to the content `seq`, releasing its previous binding.
    ///
    /// Returns the content id and whether a brand-new id was minted.
    pub fn assign(
        &mut self,
        row: RowId,
        seq: Arc<[ContentCell]>,
        previous: Option<ContentId>,
    ) -> (ContentId, bool) {
        if let Some(prev) = previous {
            if self.seqs[prev.index()].as_deref() == Some(&*seq) {
                self.members[prev.index()].insert(row);
                return (prev, false);
            }
            self.release(row, prev);
        }
        if let Some(&id) = self.ids.get(&seq) {
            self.members[id.index()].insert(row);
            return (id, false);
        }
        let id = match self.free.pop() {
            Some(id) => {
                self.seqs[id.index()] = Some(seq.clone());
                self.members[id.index()].insert(row);
                id
            }
            None => {
                let id = ContentId::new(self.seqs.len());
                self.seqs.push(Some(seq.clone()));
                self.members.push(FxHashSet::from_iter([row]));
                id
            }
        };
        self.ids.insert(seq, id);
        (id, true)
    }

    /// Detach `row` from `id`; the id is recycled when unreferenced.
    pub fn release(&mut self, row: RowId, id: ContentId) {
        let members = &mut self.members[id.index()];
        members.remove(&row);
        if members.is_empty() {
            if let Some(seq) = self.seqs[id.index()].take() {
                self.ids.remove(&seq);
            }
            self.free.push(id);
        }
    }

    /// Rows currently bound to `id`.
    pub fn members(&self, id: ContentId) -> &FxHashSet<RowId> {
        &self.members[id.index()]
    }

    pub fn sequence(&self, id: ContentId) -> Option<&Arc<[ContentCell]>> {
        self.seqs.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Ids currently in use.
    pub fn live_ids(&self) -> impl Iterator<Item = ContentId> + '_ {
        self.seqs
            .iter()
            .enumerate()
            .filter(|(_, seq)| seq.is_some())
            .map(|(i, _)| ContentId::new(i))
    }
}

#[cfg(test)]
mod tests {
    use crate::base::CounterValue;
    use crate::table::ContentOutput;

    use super::*;

    fn seq(entries: &[(ContentOutput, i64)]) -> Arc<[ContentCell]> {
        entries
            .iter()
            .map(|&(output, cv)| ContentCell {
                output,
                counter_value: CounterValue::from(cv),
            })
            .collect()
    }

    #[test]
    fn test_interning_by_structural_equality() {
        let mut store = ContentStore::new();
        let a = seq(&[(ContentOutput::Accept, 0)]);
        let (id1, new1) = store.assign(RowId::new(0), a.clone(), None);
        let (id2, new2) = store.assign(RowId::new(1), a, None);
        assert!(new1);
        assert!(!new2);
        assert_eq!(id1, id2);
        assert_eq!(store.members(id1).len(), 2);
    }

    #[test]
    fn test_free_list_recycles_ids() {
        let mut store = ContentStore::new();
        let a = seq(&[(ContentOutput::Accept, 0)]);
        let b = seq(&[(ContentOutput::Reject, 1)]);
        let (id_a, _) = store.assign(RowId::new(0), a, None);
        // the only member moves to content b, freeing id_a
        let (id_b, new_b) = store.assign(RowId::new(0), b, Some(id_a));
        assert!(new_b);
        assert_eq!(id_b, id_a, "freed id is recycled for the next new content");
        assert!(store.sequence(id_a).is_some());
    }

    #[test]
    fn test_reassigning_same_content_is_stable() {
        let mut store = ContentStore::new();
        let a = seq(&[(ContentOutput::Sink, -1)]);
        let (id1, _) = store.assign(RowId::new(3), a.clone(), None);
        let (id2, new2) = store.assign(RowId::new(3), a, Some(id1));
        assert_eq!(id1, id2);
        assert!(!new2);
        assert_eq!(store.members(id1).len(), 1);
    }
}

use rustc_hash::{FxHashMap, FxHashSet};

use crate::automata::{Dfa, PeriodicExtension, RocaFromDescription};
use crate::base::Word;
use crate::table::{ContentOutput, ObservationTable, RocaTablePolicy, RowId};

type Edge = Option<(usize, i8)>;

/// The finite part of a hypothesis: one state per content class of short
/// rows, levelled by the class's counter value. Classes whose content is
/// pure sink, or whose level is unknown, are left out (they are the sink).
#[derive(Debug, Clone)]
struct Skeleton {
    levels: Vec<i64>,
    accepting: Vec<bool>,
    edges: Vec<Vec<Edge>>,
    initial: Option<usize>,
}

/// Deterministic construction of candidate ROCAs from a closed, consistent
/// table.
///
/// For every accepted period p the builder emits one periodic description
/// anchored one level below the table's counter limit (the top level of the
/// table misses the states only reachable by exceeding the limit, so the
/// repetition cannot be anchored there). If no period is accepted, the
/// degenerate DFA view of the skeleton is the only candidate; otherwise it
/// is appended last and the loop tests every candidate.
pub struct HypothesisBuilder<'a> {
    table: &'a ObservationTable<RocaTablePolicy>,
}

impl<'a> HypothesisBuilder<'a> {
    pub fn new(table: &'a ObservationTable<RocaTablePolicy>) -> Self {
        Self { table }
    }

    /// All candidate hypotheses, periodic candidates first (ascending
    /// period), the DFA view last.
    pub fn candidates(&self) -> Vec<RocaFromDescription> {
        let skeleton = self.skeleton();
        let limit = self.table.counter_limit();
        let mut out = Vec::new();
        let anchor = limit - 1;
        if anchor >= 1 {
            for period in 1..=((anchor + 1) / 2) {
                if anchor - 2 * period + 1 < 0 {
                    break;
                }
                if let Some((down, up)) = self.band_map(&skeleton, anchor, period) {
                    tracing::debug!(period, anchor, "periodic description accepted");
                    out.push(self.truncated(&skeleton, anchor, period, down, up));
                }
            }
        }
        out.push(self.dfa_view(&skeleton));
        out
    }

    /// The table's skeleton viewed as a plain DFA over the same classes.
    pub fn learned_dfa(&self) -> Dfa {
        let skeleton = self.skeleton();
        let states = skeleton.levels.len().max(1);
        let initial = skeleton.initial.unwrap_or(0);
        let mut dfa = Dfa::new(self.table.alphabet().clone(), states, initial);
        if skeleton.initial.is_some() {
            for (state, &accepting) in skeleton.accepting.iter().enumerate() {
                dfa.set_accepting(state, accepting);
            }
            for (state, edges) in skeleton.edges.iter().enumerate() {
                for (symbol, edge) in edges.iter().enumerate() {
                    if let Some((target, _)) = edge {
                        dfa.set_transition(state, symbol, *target);
                    }
                }
            }
        }
        dfa
    }

    // ------------------------------------------------------------------

    fn skeleton(&self) -> Skeleton {
        let table = self.table;
        let layer = table.layer(0);
        let limit = table.counter_limit();

        // classes in deterministic order: by canonical short row id
        let mut classes: Vec<(RowId, crate::table::ContentId)> = layer
            .contents()
            .live_ids()
            .filter_map(|content| layer.canonical(content).map(|row| (row, content)))
            .collect();
        classes.sort_by_key(|&(row, _)| row);

        let eps_column = layer.suffixes().position(Word::is_empty);

        let mut state_of = FxHashMap::default();
        let mut levels = Vec::new();
        let mut accepting = Vec::new();
        for &(row_id, content) in &classes {
            let row = table.row(row_id);
            let level = row.counter_value();
            if level.is_unknown() || level.get() > limit {
                continue;
            }
            if self.is_sink_class(row_id) {
                continue;
            }
            let accepts = eps_column.is_some_and(|column| {
                row.cells()
                    .get(column)
                    .is_some_and(|cell| cell.content().output == ContentOutput::Accept)
            });
            state_of.insert(content, levels.len());
            levels.push(level.get());
            accepting.push(accepts);
        }

        let mut edges = vec![vec![None; table.alphabet().len()]; levels.len()];
        for &(row_id, content) in &classes {
            let Some(&state) = state_of.get(&content) else {
                continue;
            };
            let row = table.row(row_id);
            for symbol in 0..table.alphabet().len() {
                let Some(successor) = row.successor(symbol) else {
                    continue;
                };
                let Some(successor_content) = table.row(successor).content() else {
                    continue;
                };
                let Some(&target) = state_of.get(&successor_content) else {
                    continue;
                };
                let delta = levels[target] - levels[state];
                if (-1..=1).contains(&delta) {
                    edges[state][symbol] = Some((target, delta as i8));
                }
            }
        }

        let initial = table
            .row_by_label(&Word::epsilon())
            .and_then(|row| table.row(row).content())
            .and_then(|content| state_of.get(&content).copied());

        Skeleton {
            levels,
            accepting,
            edges,
            initial,
        }
    }

    fn is_sink_class(&self, row_id: RowId) -> bool {
        self.table
            .row(row_id)
            .cells()
            .iter()
            .all(|cell| cell.content().output == ContentOutput::Sink)
    }

    /// Try to pair the band `(anchor − p, anchor]` with the band below it,
    /// seeding from all level-aligned pairs with equal acceptance and
    /// refining away pairs whose edges disagree. The table's top level (one
    /// above `anchor`) joins the relation for verification only; its
    /// missing up-edges are skipped.
    fn band_map(
        &self,
        skeleton: &Skeleton,
        anchor: i64,
        period: i64,
    ) -> Option<(FxHashMap<usize, usize>, FxHashMap<usize, usize>)> {
        let fringe = anchor + 1;
        let floor = anchor - period + 1;
        if floor < 1 {
            return None;
        }

        let mut by_level: FxHashMap<i64, Vec<usize>> = FxHashMap::default();
        for (state, &level) in skeleton.levels.iter().enumerate() {
            by_level.entry(level).or_default().push(state);
        }

        // band levels must be size-matched with their counterparts
        for level in floor..=anchor {
            let hi = by_level.get(&level).map_or(0, Vec::len);
            let lo = by_level.get(&(level - period)).map_or(0, Vec::len);
            if hi != lo {
                return None;
            }
        }

        let mut relation: FxHashSet<(usize, usize)> = FxHashSet::default();
        for level in floor..=fringe {
            let (Some(his), Some(los)) = (by_level.get(&level), by_level.get(&(level - period)))
            else {
                continue;
            };
            for &q in his {
                for &r in los {
                    if skeleton.accepting[q] == skeleton.accepting[r] {
                        relation.insert((q, r));
                    }
                }
            }
        }

        // refine to the coarsest edge-compatible relation
        loop {
            let mut removed = false;
            let pairs: Vec<_> = relation.iter().copied().collect();
            for (q, r) in pairs {
                if !self.compatible(skeleton, &relation, q, r, fringe, floor) {
                    relation.remove(&(q, r));
                    removed = true;
                }
            }
            if !removed {
                break;
            }
        }

        // the band itself needs a unique, bijective pairing
        let mut down = FxHashMap::default();
        let mut up = FxHashMap::default();
        for level in floor..=fringe {
            let Some(his) = by_level.get(&level) else {
                continue;
            };
            for &q in his {
                let mut partners: Vec<usize> = relation
                    .iter()
                    .filter(|&&(a, _)| a == q)
                    .map(|&(_, b)| b)
                    .collect();
                partners.sort_unstable();
                if level <= anchor {
                    // ambiguous pairings resolve deterministically; a wrong
                    // choice only costs a refuted candidate
                    let Some(&partner) = partners.iter().find(|p| !up.contains_key(*p)) else {
                        return None;
                    };
                    up.insert(partner, q);
                    down.insert(q, partner);
                } else if partners.is_empty() {
                    return None;
                }
            }
        }
        Some((down, up))
    }

    fn compatible(
        &self,
        skeleton: &Skeleton,
        relation: &FxHashSet<(usize, usize)>,
        q: usize,
        r: usize,
        fringe: i64,
        floor: i64,
    ) -> bool {
        for symbol in 0..self.table.alphabet().len() {
            let e_q = skeleton.edges[q][symbol];
            let e_r = skeleton.edges[r][symbol];
            match (e_q, e_r) {
                (None, None) => {}
                // the fringe level cannot see its own up-edges
                (None, Some((_, 1))) if skeleton.levels[q] == fringe => {}
                (None, Some(_)) | (Some(_), None) => return false,
                (Some((t_q, d_q)), Some((t_r, d_r))) => {
                    if d_q != d_r {
                        return false;
                    }
                    if skeleton.levels[t_q] >= floor && !relation.contains(&(t_q, t_r)) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Emit the periodic description: states up to `anchor`, edges into the
    /// cut fringe dropped (the extension reconstructs them), band maps
    /// re-indexed onto the kept states.
    fn truncated(
        &self,
        skeleton: &Skeleton,
        anchor: i64,
        period: i64,
        down: FxHashMap<usize, usize>,
        up: FxHashMap<usize, usize>,
    ) -> RocaFromDescription {
        let kept: Vec<usize> = (0..skeleton.levels.len())
            .filter(|&state| skeleton.levels[state] <= anchor)
            .collect();
        let remap: FxHashMap<usize, usize> = kept
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();

        let levels: Vec<i64> = kept.iter().map(|&s| skeleton.levels[s]).collect();
        let accepting: Vec<bool> = kept.iter().map(|&s| skeleton.accepting[s]).collect();
        let edges: Vec<Vec<Edge>> = kept
            .iter()
            .map(|&s| {
                skeleton.edges[s]
                    .iter()
                    .map(|edge| {
                        edge.and_then(|(target, delta)| {
                            remap.get(&target).map(|&t| (t, delta))
                        })
                    })
                    .collect()
            })
            .collect();

        let remap_pairs = |pairs: FxHashMap<usize, usize>| {
            pairs
                .into_iter()
                .filter_map(|(a, b)| Some((*remap.get(&a)?, *remap.get(&b)?)))
                .collect::<FxHashMap<_, _>>()
        };

        let initial = skeleton
            .initial
            .and_then(|state| remap.get(&state).copied());
        match initial {
            Some(initial) => RocaFromDescription::new(
                self.table.alphabet().clone(),
                levels,
                accepting,
                initial,
                edges,
                anchor,
                Some(PeriodicExtension {
                    period,
                    down: remap_pairs(down),
                    up: remap_pairs(up),
                }),
            ),
            None => self.reject_everything(),
        }
    }

    fn dfa_view(&self, skeleton: &Skeleton) -> RocaFromDescription {
        match skeleton.initial {
            Some(initial) => RocaFromDescription::new(
                self.table.alphabet().clone(),
                skeleton.levels.clone(),
                skeleton.accepting.clone(),
                initial,
                skeleton.edges.clone(),
                self.table.counter_limit(),
                None,
            ),
            None => self.reject_everything(),
        }
    }

    /// The hypothesis when even ε is outside prefix(L): reject everything.
    fn reject_everything(&self) -> RocaFromDescription {
        RocaFromDescription::new(
            self.table.alphabet().clone(),
            vec![0],
            vec![false],
            0,
            vec![vec![None; self.table.alphabet().len()]],
            0,
            None,
        )
    }
}

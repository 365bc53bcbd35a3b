//! The counter-annotated observation table and its supporting stores.
//!
//! - [`RowStore`] / [`ContentStore`] - row arena and interned row contents
//! - [`ObservationTree`] - trie caching every oracle answer (the only path
//!   oracle results take into the table)
//! - [`PrefixTracker`] - incremental prefix-closed view of prefix(L)
//! - [`ObservationTable`] - the table itself, generic over a [`TablePolicy`]:
//!   the counter-annotated single-layer shape ([`RocaTablePolicy`]) and the
//!   stratified layered shape ([`VcaTablePolicy`]) share every contract

mod observation;
mod policy;
mod prefix;
mod store;
mod tree;

pub use observation::{Inconsistency, Layer, ObservationTable, UnclosedGroup, UnclosedGroups};
pub use policy::{RocaTablePolicy, TablePolicy, VcaTablePolicy};
pub use prefix::{PrefixLookup, PrefixTracker};
pub use store::{ContentStore, Row, RowKind, RowStore};
pub use tree::{NodeId, ObservationTree};

use crate::base::CounterValue;
use crate::oracles::AcceptingOrExit;

/// Identifier of a row in the row arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(u32);

impl RowId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of an interned row content. Freed ids are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(u32);

impl ContentId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One raw table cell.
///
/// `output` is the oracle's answer for `row · suffix`; it stays `None` for
/// cells lying outside the counter limit, which are never sent to the
/// oracle. The counter value is UNKNOWN exactly when the word is outside
/// prefix(L).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub output: Option<AcceptingOrExit>,
    pub counter_value: CounterValue,
    pub outside_limit: bool,
}

impl Cell {
    pub fn empty() -> Self {
        Self {
            output: None,
            counter_value: CounterValue::UNKNOWN,
            outside_limit: false,
        }
    }

    /// The restricted-view entry used for row equivalence: exit and
    /// outside-limit cells collapse into the sink, everything else keeps its
    /// verdict and counter value.
    pub fn content(&self) -> ContentCell {
        if self.outside_limit {
            return ContentCell::SINK;
        }
        match self.output {
            None | Some(AcceptingOrExit::Exit) => ContentCell::SINK,
            Some(AcceptingOrExit::Accepting) => ContentCell {
                output: ContentOutput::Accept,
                counter_value: self.counter_value,
            },
            Some(AcceptingOrExit::Rejecting) => ContentCell {
                output: ContentOutput::Reject,
                counter_value: self.counter_value,
            },
        }
    }
}

/// Output component of a [`ContentCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentOutput {
    Accept,
    Reject,
    /// Exit or outside the counter limit: the restricted view's sink.
    Sink,
}

/// One entry of an interned content sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentCell {
    pub output: ContentOutput,
    pub counter_value: CounterValue,
}

impl ContentCell {
    pub const SINK: ContentCell = ContentCell {
        output: ContentOutput::Sink,
        counter_value: CounterValue::UNKNOWN,
    };
}

/// Whether PASS B may reuse counter values already present in the
/// observation tree before consulting the counter-value oracle.
///
/// Disabled during `initialize` (rows have no contents yet, and the initial
/// fill doubles as a validation pass), enabled afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterValuePropagation {
    Disabled,
    Enabled,
}

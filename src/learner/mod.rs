//! The learning loop: hypothesis construction from the table, the L*-style
//! refinement state machine with counter-limit escalation, and the
//! experiment driver running full-equivalence rounds.

mod experiment;
mod hypothesis;
mod lstar;

pub use experiment::{Experiment, Outcome};
pub use hypothesis::HypothesisBuilder;
pub use lstar::LStarRoca;

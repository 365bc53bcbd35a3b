//! Shared targets and harness helpers for the scenario tests.
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ocalearn::automata::Roca;
use ocalearn::base::{Alphabet, Word};
use ocalearn::learner::{Experiment, LStarRoca, Outcome};
use ocalearn::oracles::{BfsEquivalenceOracle, RestrictedRocaOracle, RocaSimulator};

pub fn w(s: &str) -> Word {
    Word::from_symbols(s.chars())
}

/// L = { aⁿbⁿ | n ≥ 0 }, two locations, counter up on `a`, down on `b`.
pub fn tiny_roca() -> Roca {
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

/// The classical two-state round-trip DFA over {paul, mary}, promoted to an
/// ROCA whose counter never moves: L = (paul · mary)*.
pub fn paul_and_mary() -> Roca {
    Roca::builder(Alphabet::from_symbols(["paul", "mary"]), 2)
        .accepting(0)
        .on_any(0, "paul", 1, 0)
        .unwrap()
        .on_any(1, "mary", 0, 0)
        .unwrap()
        .build()
}

/// A two-location ROCA over {a, b, c} that accepts the regular language
/// (a·b)* but pushes the counter on `a`, so the learner has to escalate the
/// counter limit at least once. `c` resets nothing and kills the run.
pub fn regular_roca() -> Roca {
    Roca::builder(Alphabet::from_symbols(["a", "b", "c"]), 2)
        .accepting(0)
        .on_any(0, "a", 1, 1)
        .unwrap()
        .on_positive(1, "b", 0, -1)
        .unwrap()
        .build()
}

/// L₁ = { aⁿ bⁿ⁺¹ a | n > 0 }.
pub fn bn_plus_one_then_a() -> Roca {
    Roca::builder(Alphabet::from_symbols(["a", "b"]), 5)
        .accepting(4)
        .on_zero(0, "a", 1, 1)
        .unwrap()
        .on_positive(1, "a", 1, 1)
        .unwrap()
        .on_positive(1, "b", 2, -1)
        .unwrap()
        .on_positive(2, "b", 2, -1)
        .unwrap()
        .on_zero(2, "b", 3, 0)
        .unwrap()
        .on_zero(3, "a", 4, 0)
        .unwrap()
        .build()
}

/// L₂ = { aⁿ bⁿ⁺¹ | n > 0 }.
pub fn bn_plus_one() -> Roca {
    Roca::builder(Alphabet::from_symbols(["a", "b"]), 4)
        .accepting(3)
        .on_zero(0, "a", 1, 1)
        .unwrap()
        .on_positive(1, "a", 1, 1)
        .unwrap()
        .on_positive(1, "b", 2, -1)
        .unwrap()
        .on_positive(2, "b", 2, -1)
        .unwrap()
        .on_zero(2, "b", 3, 0)
        .unwrap()
        .build()
}

/// A seeded random ROCA with total transitions over {a, b}.
pub fn random_roca(seed: u64, size: usize) -> Roca {
    let mut rng = StdRng::seed_from_u64(seed);
    let alphabet = Alphabet::from_symbols(["a", "b"]);
    let symbols = ["a", "b"];
    let mut builder = Roca::builder(alphabet, size);
    for location in 0..size {
        if rng.gen_bool(0.5) {
            builder = builder.accepting(location);
        }
        for symbol in symbols {
            let target = rng.gen_range(0..size);
            let delta = rng.gen_range(0..=1);
            builder = builder.on_zero(location, symbol, target, delta).unwrap();
            let target = rng.gen_range(0..size);
            let delta = rng.gen_range(-1..=1);
            builder = builder
                .on_positive(location, symbol, target, delta)
                .unwrap();
        }
    }
    builder.build()
}

pub type TargetExperiment = Experiment<
    RocaSimulator,
    RocaSimulator,
    RestrictedRocaOracle,
    BfsEquivalenceOracle<Roca>,
>;

/// Wire a full experiment against `target` with simulator oracles.
pub fn experiment_for(target: &Roca, max_rounds: usize) -> TargetExperiment {
    let learner = LStarRoca::new(
        target.alphabet().clone(),
        RocaSimulator::new(target.clone()),
        RocaSimulator::new(target.clone()),
        RestrictedRocaOracle::new(target.clone(), 0),
    );
    Experiment::new(learner, BfsEquivalenceOracle::new(target.clone()), max_rounds)
}

/// Run to convergence and hand back the experiment and learned hypothesis.
pub fn learn(target: &Roca, max_rounds: usize) -> TargetExperiment {
    let mut experiment = experiment_for(target, max_rounds);
    let outcome = experiment.run().expect("learning run failed");
    assert!(
        matches!(outcome, Outcome::Converged(_)),
        "expected convergence, got {outcome:?}"
    );
    experiment
}

/// Assert with a fresh explorer that `hypothesis` matches `target`.
pub fn assert_equivalent(target: &Roca, hypothesis: &impl ocalearn::automata::CounterAutomaton) {
    use ocalearn::oracles::RocaEquivalenceOracle;
    let mut oracle = BfsEquivalenceOracle::new(target.clone());
    let ce = oracle.find_counter_example(hypothesis, target.alphabet());
    assert!(ce.is_none(), "hypothesis differs from target on {ce:?}");
}

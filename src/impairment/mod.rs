use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod duplicate;
mod four_state;
mod gilbert_elliott;
mod uniform;

pub use duplicate::Duplicator;
pub use four_state::{FourState, FourStateParams};
pub use gilbert_elliott::{GeParams, GilbertElliott};
pub use uniform::Uniform;

/// Size of the draw range. Draws fall in `[0, RANDOM_MAX)`, so a threshold of
/// `RANDOM_MAX` always fires and `0` never does.
pub const RANDOM_MAX: u64 = 1_000_000_000;

/// Convert a percentage in `[0, 100]` to a draw threshold.
pub fn percent_to_threshold(percent: f64) -> u64 {
    (percent * (RANDOM_MAX / 100) as f64) as u64
}

/// Source of uniform integer draws in `[0, RANDOM_MAX)`.
pub trait DrawSource: Send {
    fn draw(&mut self) -> u64;
}

pub struct SeededDraws(StdRng);

impl SeededDraws {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl DrawSource for SeededDraws {
    #[inline]
    fn draw(&mut self) -> u64 {
        self.0.gen_range(0..RANDOM_MAX)
    }
}

/// Per-packet loss decision.
pub trait LossProcess: Send {
    fn is_lost(&mut self, draws: &mut dyn DrawSource) -> bool;
}

// ==========================================
// Markov chain state
// ==========================================

/// Current state of a loss chain.
///
/// Cloning shares the state: every port handed the same `ChainState` walks
/// one chain. Updates are plain atomic stores, so concurrent ingress cores
/// may overwrite each other's transition; the chain itself never tears.
#[derive(Debug, Clone)]
pub struct ChainState(Arc<AtomicU8>);

impl ChainState {
    pub fn new(initial: u8) -> Self {
        Self(Arc::new(AtomicU8::new(initial)))
    }

    #[inline]
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, state: u8) {
        self.0.store(state, Ordering::Relaxed);
    }
}

// ==========================================
// Loss mode (configuration) and loss model (instance)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossMode {
    None,
    Uniform { loss: u64 },
    GilbertElliott(GeParams),
    FourState(FourStateParams),
}

impl LossMode {
    pub fn initial_state(&self) -> u8 {
        match self {
            LossMode::FourState(_) => four_state::INITIAL_STATE,
            _ => gilbert_elliott::NORMAL,
        }
    }

    pub fn new_chain(&self) -> ChainState {
        ChainState::new(self.initial_state())
    }

    pub fn instantiate(&self, chain: ChainState) -> LossModel {
        match *self {
            LossMode::None => LossModel::None,
            LossMode::Uniform { loss } => LossModel::Uniform(Uniform::new(loss)),
            LossMode::GilbertElliott(params) => {
                LossModel::GilbertElliott(GilbertElliott::new(params, chain))
            }
            LossMode::FourState(params) => LossModel::FourState(FourState::new(params, chain)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LossMode::None => "none",
            LossMode::Uniform { .. } => "uniform",
            LossMode::GilbertElliott(_) => "gilbert-elliott",
            LossMode::FourState(_) => "four-state",
        }
    }
}

pub enum LossModel {
    None,
    Uniform(Uniform),
    GilbertElliott(GilbertElliott),
    FourState(FourState),
}

impl LossProcess for LossModel {
    #[inline]
    fn is_lost(&mut self, draws: &mut dyn DrawSource) -> bool {
        match self {
            LossModel::None => false,
            LossModel::Uniform(m) => m.is_lost(draws),
            LossModel::GilbertElliott(m) => m.is_lost(draws),
            LossModel::FourState(m) => m.is_lost(draws),
        }
    }
}

/// Everything the ingress stage consults per packet: a loss model, the
/// independent duplication draw and the generator feeding both.
pub struct Impairment<D = SeededDraws> {
    loss: LossModel,
    duplicator: Duplicator,
    draws: D,
}

impl<D: DrawSource> Impairment<D> {
    pub fn new(loss: LossModel, duplicator: Duplicator, draws: D) -> Self {
        Self {
            loss,
            duplicator,
            draws,
        }
    }

    #[inline]
    pub fn is_lost(&mut self) -> bool {
        self.loss.is_lost(&mut self.draws)
    }

    #[inline]
    pub fn is_duplicated(&mut self) -> bool {
        self.duplicator.is_duplicated(&mut self.draws)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::DrawSource;

    /// Replays a fixed list of draws, then panics.
    pub struct ScriptedDraws(pub VecDeque<u64>);

    impl ScriptedDraws {
        pub fn new(draws: &[u64]) -> Self {
            Self(draws.iter().copied().collect())
        }
    }

    impl DrawSource for ScriptedDraws {
        fn draw(&mut self) -> u64 {
            self.0.pop_front().expect("draw script exhausted")
        }
    }
}

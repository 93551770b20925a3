use crate::impairment::{ChainState, DrawSource, LossProcess};

// State 1: received, gap period.
// State 2: received, burst period.
// State 3: lost, burst period.
// State 4: isolated loss, gap period.
pub(crate) const INITIAL_STATE: u8 = 1;

/// Transition thresholds of the four-state chain.
///
/// From state 1 the draw picks 3 below `p13`, 4 below `p13 + p14`; from 3 it
/// picks 1 below `p31`, 2 below `p31 + p32`; state 2 moves to 3 below `p23`;
/// state 4 always returns to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourStateParams {
    pub p13: u64,
    pub p14: u64,
    pub p23: u64,
    pub p31: u64,
    pub p32: u64,
}

pub struct FourState {
    params: FourStateParams,
    state: ChainState,
}

impl FourState {
    pub fn new(params: FourStateParams, state: ChainState) -> Self {
        Self { params, state }
    }

    pub fn state(&self) -> u8 {
        self.state.get()
    }

    fn next(&self, state: u8, rnd: u64) -> u8 {
        let p = &self.params;
        match state {
            1 if rnd < p.p13 => 3,
            1 if rnd < p.p13 + p.p14 => 4,
            2 if rnd < p.p23 => 3,
            3 if rnd < p.p31 => 1,
            3 if rnd < p.p31 + p.p32 => 2,
            4 => 1,
            s => s,
        }
    }
}

impl LossProcess for FourState {
    /// One draw per packet, even from state 4. The packet's fate is read
    /// from the state the chain moves into: lost in 2 and 4.
    fn is_lost(&mut self, draws: &mut dyn DrawSource) -> bool {
        let rnd = draws.draw();
        let next = self.next(self.state.get(), rnd);
        self.state.set(next);
        matches!(next, 2 | 4)
    }
}

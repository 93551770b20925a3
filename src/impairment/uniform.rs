use crate::impairment::{DrawSource, LossProcess};

/// Memoryless loss: every packet is lost with the same probability.
#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    threshold: u64,
}

impl Uniform {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl LossProcess for Uniform {
    #[inline]
    fn is_lost(&mut self, draws: &mut dyn DrawSource) -> bool {
        draws.draw() < self.threshold
    }
}

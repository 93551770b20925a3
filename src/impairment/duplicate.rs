use crate::impairment::{DrawSource, LossProcess, Uniform};

/// Independent duplication decision, drawn the same way as uniform loss.
#[derive(Debug, Clone, Copy)]
pub struct Duplicator {
    draw: Uniform,
    enabled: bool,
}

impl Duplicator {
    pub fn new(threshold: u64) -> Self {
        Self {
            draw: Uniform::new(threshold),
            enabled: threshold > 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// A disabled duplicator does not consume a draw, so turning duplication
    /// off leaves the loss sequence untouched.
    #[inline]
    pub fn is_duplicated(&mut self, draws: &mut dyn DrawSource) -> bool {
        self.enabled && self.draw.is_lost(draws)
    }
}

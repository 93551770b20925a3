use crate::impairment::{ChainState, DrawSource, LossProcess};

pub(crate) const NORMAL: u8 = 0;
pub(crate) const BAD: u8 = 1;

/// Gilbert-Elliott parameters, all as draw thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeParams {
    pub loss_normal: u64,
    pub loss_bad: u64,
    pub normal_to_bad: u64,
    pub bad_to_normal: u64,
}

/// Two-state Markov loss.
///
/// Each packet takes two draws: one against the current state's loss
/// threshold, then one against its transition threshold. The state carries
/// over to the next packet.
pub struct GilbertElliott {
    params: GeParams,
    state: ChainState,
}

impl GilbertElliott {
    pub fn new(params: GeParams, state: ChainState) -> Self {
        Self { params, state }
    }

    pub fn is_bad(&self) -> bool {
        self.state.get() == BAD
    }
}

impl LossProcess for GilbertElliott {
    fn is_lost(&mut self, draws: &mut dyn DrawSource) -> bool {
        let state = self.state.get();
        let (loss, transition) = if state == NORMAL {
            (self.params.loss_normal, self.params.normal_to_bad)
        } else {
            (self.params.loss_bad, self.params.bad_to_normal)
        };

        let lost = draws.draw() < loss;
        if draws.draw() < transition {
            self.state.set(if state == NORMAL { BAD } else { NORMAL });
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impairment::testing::ScriptedDraws;
    use crate::impairment::{SeededDraws, Uniform, percent_to_threshold};

    fn params(nl: f64, bl: f64, nb: f64, bn: f64) -> GeParams {
        GeParams {
            loss_normal: percent_to_threshold(nl),
            loss_bad: percent_to_threshold(bl),
            normal_to_bad: percent_to_threshold(nb),
            bad_to_normal: percent_to_threshold(bn),
        }
    }

    #[test]
    fn test_loss_uses_state_before_transition() {
        let params = GeParams {
            loss_normal: 10,
            loss_bad: 1000,
            normal_to_bad: 10,
            bad_to_normal: 10,
        };
        let mut ge = GilbertElliott::new(params, ChainState::new(NORMAL));
        // Normal: draw 500 is not a loss, draw 5 flips to Bad.
        // Bad: draw 500 is a loss, draw 50 stays Bad.
        // Bad: draw 2000 is not a loss, draw 0 flips back.
        let mut draws = ScriptedDraws::new(&[500, 5, 500, 50, 2000, 0]);
        assert!(!ge.is_lost(&mut draws));
        assert!(ge.is_bad());
        assert!(ge.is_lost(&mut draws));
        assert!(ge.is_bad());
        assert!(!ge.is_lost(&mut draws));
        assert!(!ge.is_bad());
    }

    #[test]
    fn test_state_persists_across_calls() {
        let mut ge = GilbertElliott::new(params(0.0, 100.0, 100.0, 0.0), ChainState::new(NORMAL));
        let mut draws = SeededDraws::new(9);
        assert!(!ge.is_lost(&mut draws));
        for _ in 0..1000 {
            assert!(ge.is_lost(&mut draws));
        }
    }

    fn mean_loss_run(mut lost: impl FnMut() -> bool, n: usize) -> (f64, f64) {
        let mut losses = 0usize;
        let mut runs = 0usize;
        let mut in_run = false;
        for _ in 0..n {
            if lost() {
                losses += 1;
                if !in_run {
                    runs += 1;
                    in_run = true;
                }
            } else {
                in_run = false;
            }
        }
        (losses as f64 / n as f64, losses as f64 / runs.max(1) as f64)
    }

    #[test]
    fn test_burstier_than_uniform_at_equal_mean() {
        const N: usize = 1_000_000;
        // Stationary P(bad) = 1 / (1 + 9) = 10%, loss only in Bad: mean loss 10%.
        let mut ge = GilbertElliott::new(params(0.0, 100.0, 1.0, 9.0), ChainState::new(NORMAL));
        let mut ge_draws = SeededDraws::new(21);
        let (ge_rate, ge_run) = mean_loss_run(|| ge.is_lost(&mut ge_draws), N);

        let mut uni = Uniform::new(percent_to_threshold(ge_rate * 100.0));
        let mut uni_draws = SeededDraws::new(22);
        let (uni_rate, uni_run) = mean_loss_run(|| uni.is_lost(&mut uni_draws), N);

        assert!((ge_rate - 0.10).abs() < 0.01, "ge rate {ge_rate}");
        assert!((uni_rate - ge_rate).abs() < 0.005);
        // Expected runs: ~11 packets for GE, ~1.1 for uniform.
        assert!(ge_run > 5.0 * uni_run, "ge {ge_run} uniform {uni_run}");
    }
}

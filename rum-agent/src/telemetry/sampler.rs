//! Session-based sampling.
//!
//! Every span of a session shares the same keep/drop decision, derived from
//! the low 64 bits of the session id compared against `ratio * u64::MAX`.

use super::session::SessionId;

#[derive(Debug, Clone, Copy)]
pub struct SessionSampler {
    ratio: f64,
    threshold: u64,
}

impl SessionSampler {
    /// `ratio` is clamped to `0.0..=1.0`.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        let threshold = if ratio >= 1.0 {
            u64::MAX
        } else {
            (ratio * u64::MAX as f64) as u64
        };
        Self { ratio, threshold }
    }

    pub fn always_on() -> Self {
        Self::new(1.0)
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn is_sampled(&self, session_id: &SessionId) -> bool {
        if self.ratio >= 1.0 {
            return true;
        }
        if self.ratio <= 0.0 {
            return false;
        }
        session_id.low_bits() < self.threshold
    }
}

impl Default for SessionSampler {
    fn default() -> Self {
        Self::always_on()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let id = SessionId::generate();
        assert!(SessionSampler::new(1.0).is_sampled(&id));
        assert!(!SessionSampler::new(0.0).is_sampled(&id));
        assert_eq!(SessionSampler::new(7.0).ratio(), 1.0);
        assert_eq!(SessionSampler::new(-1.0).ratio(), 0.0);
    }

    #[test]
    fn test_decision_follows_low_bits() {
        let sampler = SessionSampler::new(0.5);
        assert!(sampler.is_sampled(&SessionId::from("ffffffffffffffff0000000000000001")));
        assert!(!sampler.is_sampled(&SessionId::from("0000000000000000fffffffffffffff0")));
    }

    #[test]
    fn test_ratio_roughly_respected() {
        let sampler = SessionSampler::new(0.25);
        let kept = (0..4000)
            .filter(|_| sampler.is_sampled(&SessionId::generate()))
            .count();
        assert!((700..1300).contains(&kept), "kept {}", kept);
    }
}

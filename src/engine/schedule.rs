//! Stage schedule: maps elapsed test time to a desired VU count.

use std::time::Duration;

/// One ramp segment: move to `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Open-loop concurrency profile. The target depends only on elapsed time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    start: usize,
    stages: Vec<Stage>,
}

impl Schedule {
    pub fn new(start: usize, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    /// `vus` held for `duration`.
    pub fn constant(vus: usize, duration: Duration) -> Self {
        Self::new(vus, vec![Stage::new(duration, vus)])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Saturates at `Duration::MAX`.
    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration))
    }

    /// Highest target reached at any point.
    pub fn peak(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, usize::max)
    }

    /// Desired VUs at `elapsed`. Ramps interpolate linearly from the previous
    /// target and round to the nearest VU; past the last stage the target is 0.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut stage_start = Duration::ZERO;
        let mut from = self.start;
        for stage in &self.stages {
            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed < stage_end {
                if from == stage.target {
                    return from;
                }
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let value = from as f64 + (stage.target as f64 - from as f64) * progress;
                return value.round() as usize;
            }
            stage_start = stage_end;
            from = stage.target;
        }
        0
    }

    /// Index of the stage running at `elapsed`, if any.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            stage_end = stage_end.saturating_add(stage.duration);
            if elapsed < stage_end {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ramp() -> Schedule {
        Schedule::new(
            0,
            vec![
                Stage::new(secs(10), 5),
                Stage::new(secs(20), 5),
                Stage::new(secs(10), 0),
            ],
        )
    }

    #[test]
    fn test_start_value_at_zero() {
        assert_eq!(ramp().target_at(Duration::ZERO), 0);
        assert_eq!(Schedule::new(3, vec![Stage::new(secs(10), 7)]).target_at(Duration::ZERO), 3);
    }

    #[test]
    fn test_linear_ramp_and_plateau() {
        let s = ramp();
        assert_eq!(s.target_at(secs(2)), 1);
        assert_eq!(s.target_at(secs(5)), 3);
        assert_eq!(s.target_at(secs(10)), 5);
        assert_eq!(s.target_at(secs(25)), 5);
        assert_eq!(s.target_at(secs(35)), 3);
    }

    #[test]
    fn test_after_last_stage_is_zero() {
        let s = ramp();
        assert_eq!(s.total_duration(), secs(40));
        assert_eq!(s.target_at(secs(40)), 0);
        assert_eq!(s.target_at(secs(1000)), 0);
        assert_eq!(s.stage_index_at(secs(40)), None);
        assert_eq!(s.stage_index_at(secs(15)), Some(1));
    }

    #[test]
    fn test_pure_function_of_time() {
        let s = ramp();
        for ms in (0..40_000).step_by(137) {
            let t = Duration::from_millis(ms);
            assert_eq!(s.target_at(t), s.target_at(t));
        }
    }

    #[test]
    fn test_bounded_and_monotonic_within_each_stage() {
        let s = Schedule::new(
            2,
            vec![
                Stage::new(secs(7), 13),
                Stage::new(secs(3), 13),
                Stage::new(secs(9), 4),
                Stage::new(secs(5), 20),
            ],
        );
        let mut stage_start = Duration::ZERO;
        let mut from = s.start();
        for stage in s.stages() {
            let lo = from.min(stage.target);
            let hi = from.max(stage.target);
            let mut prev = from;
            let mut t = stage_start;
            while t < stage_start + stage.duration {
                let v = s.target_at(t);
                assert!(v >= lo && v <= hi, "{} outside [{}, {}] at {:?}", v, lo, hi, t);
                if stage.target >= from {
                    assert!(v >= prev);
                } else {
                    assert!(v <= prev);
                }
                prev = v;
                t += Duration::from_millis(50);
            }
            stage_start += stage.duration;
            from = stage.target;
        }
    }

    #[test]
    fn test_zero_length_stage_jumps() {
        let s = Schedule::new(0, vec![Stage::new(Duration::ZERO, 8), Stage::new(secs(5), 8)]);
        assert_eq!(s.target_at(Duration::ZERO), 8);
        assert_eq!(s.target_at(secs(4)), 8);
        assert_eq!(s.peak(), 8);
    }

    #[test]
    fn test_constant() {
        let s = Schedule::constant(10, secs(30));
        assert_eq!(s.target_at(Duration::ZERO), 10);
        assert_eq!(s.target_at(secs(29)), 10);
        assert_eq!(s.target_at(secs(30)), 0);
    }

    #[test]
    fn test_huge_stages_saturate() {
        let s = Schedule::new(0, vec![Stage::new(Duration::MAX, 4), Stage::new(secs(10), 0)]);
        assert_eq!(s.total_duration(), Duration::MAX);
        assert_eq!(s.target_at(secs(1)), 0);
        assert_eq!(s.stage_index_at(secs(1)), Some(0));
    }
}

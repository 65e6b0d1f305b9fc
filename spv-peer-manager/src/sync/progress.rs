/// Sync progress across sessions, never decreasing until reset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SyncProgress {
    start_height: u32,
    high_water: f64,
}

impl SyncProgress {
    pub fn new(start_height: u32) -> Self {
        Self {
            start_height,
            high_water: 0.0,
        }
    }

    /// Measure later updates from `start_height`, keeping the high-water mark.
    pub fn restart(&mut self, start_height: u32) {
        self.start_height = start_height;
    }

    pub fn start_height(&self) -> u32 {
        self.start_height
    }

    /// Fraction of the way from the session start to `estimated`, clamped to `[0, 1]`.
    pub fn update(&mut self, last: u32, estimated: u32) -> f64 {
        let fraction = if last >= estimated {
            1.0
        } else {
            let done = last.saturating_sub(self.start_height) as f64;
            let total = estimated.saturating_sub(self.start_height).max(1) as f64;
            (done / total).clamp(0.0, 1.0)
        };
        self.high_water = self.high_water.max(fraction);
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let mut progress = SyncProgress::new(100);
        assert_eq!(progress.update(100, 500), 0.0);
        assert_eq!(progress.update(300, 500), 0.5);
        assert_eq!(progress.update(500, 500), 1.0);
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut progress = SyncProgress::new(0);
        assert_eq!(progress.update(50, 100), 0.5);
        // A peer reporting a higher height would lower the raw fraction.
        assert_eq!(progress.update(60, 200), 0.5);
        // A rollback below the start height clamps to the high-water mark.
        assert_eq!(progress.update(0, 100), 0.5);
        assert_eq!(progress.update(150, 200), 0.75);
    }

    #[test]
    fn test_restart_keeps_high_water() {
        let mut progress = SyncProgress::new(0);
        assert_eq!(progress.update(100, 100), 1.0);
        progress.restart(100);
        assert_eq!(progress.start_height(), 100);
        assert_eq!(progress.update(100, 150), 1.0);
    }

    #[test]
    fn test_caught_up_is_complete() {
        let mut progress = SyncProgress::new(10);
        assert_eq!(progress.update(10, 10), 1.0);
        assert_eq!(progress.update(12, 10), 1.0);
    }
}

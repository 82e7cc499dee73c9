use std::collections::HashSet;

use crate::app::models::Metric;

/// Count of frames in `current` not seen in `previous`; zero with no baseline.
pub fn count_new_frames(previous: &HashSet<u64>, current: &HashSet<u64>) -> usize {
    if previous.is_empty() {
        return 0;
    }
    current.difference(previous).count()
}

/// Frame timestamps seen on the previous tick for one surface.
///
/// The reported value is the number of new frames per tick. Ticks drift with
/// command latency, so this approximates FPS rather than measuring it.
#[derive(Debug, Default)]
pub struct FrameTracker {
    previous: HashSet<u64>,
}

impl FrameTracker {
    /// Replaces the stored set with `current` and returns the new-frame count.
    pub fn observe(&mut self, current: HashSet<u64>) -> Metric {
        let new_frames = count_new_frames(&self.previous, &current);
        self.previous = current;
        Metric::value(format!("{:.2}", new_frames as f64))
    }
}

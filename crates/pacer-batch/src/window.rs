use std::collections::VecDeque;

/// Fixed-capacity window of per-batch success ratios. Oldest entries fall off.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    capacity: usize,
    ratios: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ratios: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, ratio: f64) {
        if self.ratios.len() == self.capacity {
            self.ratios.pop_front();
        }
        self.ratios.push_back(ratio);
    }

    pub fn average(&self) -> Option<f64> {
        if self.ratios.is_empty() {
            return None;
        }
        Some(self.ratios.iter().sum::<f64>() / self.ratios.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.ratios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratios.is_empty()
    }

    pub fn clear(&mut self) {
        self.ratios.clear();
    }
}

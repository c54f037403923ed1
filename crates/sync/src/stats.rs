//! Connection-quality statistics.

/// Fixed-size ring of samples with a running average and deviation, used to
/// judge connection health from packet inter-arrival times.
#[derive(Debug, Clone)]
pub struct StatRing {
    data: Vec<f32>,
    index: usize,
    avg_sum: f32,
}

impl StatRing {
    pub fn new(size: usize, default: f32) -> Self {
        let mut ring = Self {
            data: Vec::new(),
            index: 0,
            avg_sum: 0.0,
        };
        ring.resize(size, default);
        ring
    }

    pub fn resize(&mut self, size: usize, default: f32) {
        self.data.clear();
        self.data.resize(size.max(1), default);
        self.reset(default);
    }

    pub fn reset(&mut self, default: f32) {
        for v in &mut self.data {
            *v = default;
        }
        self.index = 0;
        self.avg_sum = default * self.data.len() as f32;
    }

    pub fn push(&mut self, value: f32) {
        self.avg_sum -= self.data[self.index];
        self.avg_sum += value;
        self.data[self.index] = value;

        self.index = (self.index + 1) % self.data.len();
        if self.index == 0 {
            // Recompute once per cycle so float drift can't accumulate.
            self.avg_sum = self.data.iter().sum();
        }
    }

    pub fn average(&self) -> f32 {
        self.avg_sum / self.data.len() as f32
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::MAX, f32::min)
    }

    /// Standard deviation around `mean`.
    pub fn deviation(&self, mean: f32) -> f32 {
        let var = self
            .data
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f32>()
            / self.data.len() as f32;
        var.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_stream_has_zero_deviation() {
        let mut ring = StatRing::new(8, 0.0);
        for _ in 0..20 {
            ring.push(16.0);
        }
        assert!((ring.average() - 16.0).abs() < 0.001);
        assert!(ring.deviation(ring.average()) < 0.001);
    }

    #[test]
    fn oscillating_stream_has_deviation() {
        let mut ring = StatRing::new(8, 0.0);
        for i in 0..16 {
            ring.push(if i % 2 == 0 { 10.0 } else { 30.0 });
        }
        assert!((ring.average() - 20.0).abs() < 0.001);
        assert!((ring.deviation(ring.average()) - 10.0).abs() < 0.01);
    }

    #[test]
    fn reset_restores_default() {
        let mut ring = StatRing::new(4, 5.0);
        ring.push(100.0);
        ring.reset(0.0);
        assert_eq!(ring.average(), 0.0);
        assert_eq!(ring.max(), 0.0);
    }
}

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
};

use crate::{Result, dist::DistContext};

/// The default amount of recent values a `SmoothedValue` keeps.
pub const WINDOW_SIZE: usize = 20;

/// Tracks a series of values, exposing smoothed values over a window and the
/// global series average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f32>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(WINDOW_SIZE)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    /// Records `value` observed over `n` samples.
    pub fn update(&mut self, value: f32, n: usize) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n;
        self.total += value as f64 * n as f64;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn median(&self) -> f32 {
        let mut sorted: Vec<f32> = self.window.iter().copied().collect();
        sorted.sort_by(f32::total_cmp);

        // Lower median.
        sorted.get(sorted.len().saturating_sub(1) / 2).copied().unwrap_or(0.0)
    }

    pub fn avg(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    pub fn global_avg(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        (self.total / self.count as f64) as f32
    }

    pub fn max(&self) -> f32 {
        self.window.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// The latest value.
    pub fn value(&self) -> f32 {
        self.window.back().copied().unwrap_or(0.0)
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
    }
}

/// A named set of `SmoothedValue`s, one fresh logger per epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    /// Meters that only show their latest value, e.g. the learning rate.
    latest_only: Vec<String>,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one value of `name` observed over `n` samples.
    pub fn update(&mut self, name: &str, value: f32, n: usize) {
        self.meters
            .entry(name.to_string())
            .or_default()
            .update(value, n);
    }

    /// Adds an empty meter, so it exists on every rank before the first update.
    pub fn add_meter(&mut self, name: &str) {
        self.meters.entry(name.to_string()).or_default();
    }

    /// Adds a meter that's printed with its latest value only.
    pub fn add_latest_meter(&mut self, name: &str) {
        self.meters.insert(name.to_string(), SmoothedValue::new(1));
        self.latest_only.push(name.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// The global average of every meter.
    pub fn global_avgs(&self) -> BTreeMap<String, f32> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }

    /// Sums the counts and totals of every meter across the process group.
    ///
    /// The windows stay local.
    pub fn synchronize_between_processes(&mut self, dist: &mut DistContext) -> Result<()> {
        if !dist.is_distributed() {
            return Ok(());
        }

        let world = dist.world_size() as f32;
        let mut flat: Vec<f32> = self
            .meters
            .values()
            .flat_map(|m| [m.count as f32, m.total as f32])
            .collect();

        dist.all_reduce_mean(&mut flat)?;

        for (meter, pair) in self.meters.values_mut().zip(flat.chunks_exact(2)) {
            meter.count = (pair[0] * world).round() as usize;
            meter.total = (pair[1] * world) as f64;
        }

        Ok(())
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, meter) in &self.meters {
            if !first {
                write!(f, "  ")?;
            }
            first = false;

            if self.latest_only.contains(name) {
                write!(f, "{name}: {:.6}", meter.value())?;
            } else {
                write!(f, "{name}: {meter}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_and_global_average() {
        let mut v = SmoothedValue::new(3);
        for x in [1.0, 2.0, 3.0, 10.0] {
            v.update(x, 1);
        }

        assert_eq!(v.median(), 3.0);
        assert_eq!(v.avg(), 5.0);
        assert_eq!(v.max(), 10.0);
        assert_eq!(v.value(), 10.0);
        assert_eq!(v.global_avg(), 4.0);
        assert_eq!(v.count(), 4);
    }

    #[test]
    fn weighted_updates() {
        let mut v = SmoothedValue::default();
        v.update(1.0, 3);
        v.update(5.0, 1);
        assert_eq!(v.global_avg(), 2.0);
    }

    #[test]
    fn logger_formats_meters() {
        let mut logger = MetricLogger::new();
        logger.add_latest_meter("lr");
        logger.update("lr", 0.001, 1);
        logger.update("loss", 0.5, 2);

        assert_eq!(logger.global_avgs()["loss"], 0.5);
        assert_eq!(logger.to_string(), "loss: 0.5000 (0.5000)  lr: 0.001000");
    }
}

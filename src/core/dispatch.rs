// src/core/dispatch.rs

//! Adaptive throttling of the main loop's per-tick inbound drain.
//!
//! The controller keeps an exponentially-weighted moving average of queue
//! depth, processed count, and elapsed time, and turns those into a per-tick
//! time budget clamped to `[min_time_ms, max_time_ms]` plus a queue-depth
//! threshold that contracts proportionally under load. The goal is to keep
//! per-tick time bounded under bursts without starving the queue.

use crate::config::DispatchConfig;

fn clamp_f32(value: f32, lower: f32, upper: f32) -> f32 {
    value.max(lower).min(upper)
}

/// EWMA-based budget controller for inbound frame dispatch.
#[derive(Debug)]
pub struct DispatchController {
    queue_depth_ema: f32,
    processed_ema: f32,
    time_ema: f32,
    smoothing_factor: f32,
    high_watermark_multiplier: f32,
    low_watermark_multiplier: f32,
    min_time_ms: u64,
    max_time_ms: u64,
}

impl DispatchController {
    pub fn new(config: &DispatchConfig) -> Self {
        let smoothing_factor = clamp_f32(config.smoothing_factor, 0.01, 1.0);
        let low = config.low_watermark_multiplier;
        let mut high = config.high_watermark_multiplier;
        if high <= low {
            high = low + 0.1;
        }
        let min_time_ms = config.min_time_ms.max(1);
        let max_time_ms = config.max_time_ms.max(min_time_ms);
        Self {
            queue_depth_ema: 0.0,
            processed_ema: 0.0,
            time_ema: 0.0,
            smoothing_factor,
            high_watermark_multiplier: high,
            low_watermark_multiplier: low,
            min_time_ms,
            max_time_ms,
        }
    }

    fn load_ratio(&self, base_queue_threshold: usize, current_queue_size: usize) -> f32 {
        let baseline = if base_queue_threshold > 0 {
            base_queue_threshold as f32
        } else {
            1.0
        };
        let mut ratio = current_queue_size as f32 / baseline;
        if self.queue_depth_ema > 0.0 {
            ratio = ratio.max(self.queue_depth_ema / baseline);
        }
        ratio
    }

    fn normalized_load(&self, base_queue_threshold: usize, current_queue_size: usize) -> f32 {
        let load_ratio = self.load_ratio(base_queue_threshold, current_queue_size);
        let high = self
            .high_watermark_multiplier
            .max(self.low_watermark_multiplier + 0.1);
        if load_ratio <= self.low_watermark_multiplier {
            0.0
        } else if load_ratio >= high {
            1.0
        } else {
            clamp_f32(
                (load_ratio - self.low_watermark_multiplier) / (high - self.low_watermark_multiplier),
                0.0,
                1.0,
            )
        }
    }

    /// Computes the per-tick time budget in milliseconds.
    pub fn compute_time_budget(
        &self,
        base_budget_ms: u64,
        base_queue_threshold: usize,
        current_queue_size: usize,
    ) -> u64 {
        let safe_base = if base_budget_ms > 0 {
            base_budget_ms
        } else {
            self.min_time_ms
        };
        let baseline = safe_base.clamp(self.min_time_ms, self.max_time_ms.max(self.min_time_ms));

        let mut normalized = self.normalized_load(base_queue_threshold, current_queue_size);

        // When we are processing well under the baseline threshold, the queue
        // is probably backing up on slow handlers; widen the budget.
        if self.processed_ema > 0.0 && base_queue_threshold > 0 {
            let processed_ratio = self.processed_ema / base_queue_threshold as f32;
            if processed_ratio < 0.75 {
                let adjustment = clamp_f32((0.75 - processed_ratio) / 0.75, 0.0, 1.0);
                normalized = clamp_f32(normalized + adjustment * 0.5, 0.0, 1.0);
            }
        }

        // When recent ticks finished early, shrink toward the minimum.
        if self.time_ema > 0.0 && self.time_ema < baseline as f32 {
            let idle_ratio = 1.0 - clamp_f32(self.time_ema / baseline as f32, 0.0, 1.0);
            normalized = clamp_f32(normalized * (1.0 - idle_ratio * 0.5), 0.0, 1.0);
        }

        let min_budget = (((baseline as f32) * 0.75) as u64).clamp(self.min_time_ms, baseline);
        let max_budget = baseline.max(self.max_time_ms).max(min_budget);

        let result = min_budget + ((max_budget - min_budget) as f32 * normalized) as u64;
        result.clamp(self.min_time_ms, max_budget)
    }

    /// Computes the queue-depth threshold above which the drain keeps going
    /// regardless of the time budget. Contracts as load rises.
    pub fn compute_queue_threshold(
        &self,
        base_queue_threshold: usize,
        current_queue_size: usize,
    ) -> usize {
        if base_queue_threshold == 0 {
            return current_queue_size.max(1);
        }

        let normalized = self.normalized_load(base_queue_threshold, current_queue_size);
        let min_factor = clamp_f32(self.low_watermark_multiplier, 0.1, 1.0);
        let factor = 1.0 - normalized * (1.0 - min_factor);

        ((base_queue_threshold as f32 * factor) as usize).max(1)
    }

    /// Feeds one completed drain cycle into the moving averages.
    pub fn record_cycle(
        &mut self,
        current_queue_size: usize,
        processed_messages: usize,
        elapsed_ms: u64,
    ) {
        let smoothing = self.smoothing_factor;
        for (ema, sample) in [
            (&mut self.queue_depth_ema, current_queue_size as f32),
            (&mut self.processed_ema, processed_messages as f32),
            (&mut self.time_ema, elapsed_ms as f32),
        ] {
            if *ema <= 0.0 {
                *ema = sample;
            } else {
                *ema = smoothing * sample + (1.0 - smoothing) * *ema;
            }
        }
    }
}

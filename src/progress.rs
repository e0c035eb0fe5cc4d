//! Rate-limited progress reporting with a regression-based ETA.

use log::info;
use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Observations are kept until there are at least this many...
const MIN_SMA_POINTS: usize = 30;
/// ...and the oldest is older than this.
const MAX_SMA_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Observations arriving faster than `MAX_SMA_PERIOD / TARGET_N_SMA_POINTS`
/// are randomly thinned so the sample stays near this size.
const TARGET_N_SMA_POINTS: f64 = 1_000.0;

/// Collects and reports progress on a long-running job.
#[derive(Debug)]
pub struct ProgressReporter {
    label: String,
    total_items: u64,
    start_val: u64,
    observed_items: u64,
    origin: Instant,
    points: VecDeque<(f64, u64)>,
    last_print: Option<Instant>,
    last_observation: Option<Instant>,
    print_period: Duration,
}

impl ProgressReporter {
    pub fn new(
        label: impl Into<String>,
        total_items: u64,
        start_val: u64,
        print_period: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            total_items,
            start_val: start_val.min(total_items),
            observed_items: 0,
            origin: Instant::now(),
            points: VecDeque::new(),
            last_print: None,
            last_observation: None,
            print_period,
        }
    }

    /// Records `n_items` more processed items; returns true when a progress
    /// line was logged.
    pub fn observe(&mut self, n_items: u64) -> bool {
        self.observe_at(Instant::now(), n_items)
    }

    pub fn observe_at(&mut self, now: Instant, n_items: u64) -> bool {
        self.observed_items += n_items;
        let t = now.saturating_duration_since(self.origin).as_secs_f64();
        self.points.push_back((t, self.observed_items));

        let interarrival = self
            .last_observation
            .map(|last| now.saturating_duration_since(last).as_secs_f64());
        self.last_observation = Some(now);

        let mut printed = false;
        let due = self
            .last_print
            .map_or(true, |last| now.saturating_duration_since(last) > self.print_period);
        if self.points.len() >= 2 && due {
            self.print(self.estimate_rate());
            self.last_print = Some(now);
            printed = true;
        }

        let target_interarrival = MAX_SMA_PERIOD.as_secs_f64() / TARGET_N_SMA_POINTS;
        if let Some(interarrival) = interarrival {
            if interarrival < target_interarrival {
                let keep_chance = interarrival / target_interarrival;
                if rand::thread_rng().gen::<f64>() > keep_chance && self.points.len() > 2 {
                    self.points.pop_back();
                }
            }
        }

        let horizon = t - MAX_SMA_PERIOD.as_secs_f64();
        while self.points.len() > MIN_SMA_POINTS
            && self.points.front().map_or(false, |(ts, _)| *ts < horizon)
        {
            self.points.pop_front();
        }

        printed
    }

    /// Items per second from a least-squares fit over the retained sample.
    pub fn estimate_rate(&self) -> Option<f64> {
        let n = self.points.len();
        if n < 2 {
            return None;
        }
        let n_f = n as f64;
        let mean_t = self.points.iter().map(|(t, _)| t).sum::<f64>() / n_f;
        let mean_y = self.points.iter().map(|(_, y)| *y as f64).sum::<f64>() / n_f;
        let (mut cov, mut var) = (0.0, 0.0);
        for (t, y) in &self.points {
            let dt = t - mean_t;
            cov += dt * (*y as f64 - mean_y);
            var += dt * dt;
        }
        if var <= f64::EPSILON {
            return None;
        }
        Some(cov / var)
    }

    pub fn done(&self) -> u64 {
        self.start_val + self.observed_items
    }

    fn print(&self, rate: Option<f64>) {
        let remaining = self.total_items.saturating_sub(self.done());
        let eta = match rate {
            Some(rate) if rate > 0.0 => pretty_time_delta(remaining as f64 / rate),
            _ => "unknown".to_string(),
        };
        let denominator = self.total_items.saturating_sub(self.start_val).max(1);
        let pct = self.observed_items as f64 / denominator as f64 * 100.0;
        info!(
            "{} progress: {} / {} ({:.2}%) - ETA {}",
            self.label,
            self.done(),
            self.total_items,
            pct,
            eta
        );
    }
}

/// Formats a duration in seconds as `1d2h3m4s`, dropping leading zero units.
pub fn pretty_time_delta(seconds: f64) -> String {
    let sign = if seconds < 0.0 { "-" } else { "" };
    let mut seconds = seconds.abs() as u64;
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    seconds %= 3_600;
    let minutes = seconds / 60;
    seconds %= 60;
    if days > 0 {
        format!("{}{}d{}h{}m{}s", sign, days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}{}h{}m{}s", sign, hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}{}m{}s", sign, minutes, seconds)
    } else {
        format!("{}{}s", sign, seconds)
    }
}

//! Transfer progress accounting.
//!
//! Computes percentage, ETA and throughput from position updates. A report is
//! only produced when the percentage (rounded to two decimals) moves forward,
//! so callers can forward every report without deduplicating.

use std::time::{Duration, Instant};

/// One progress sample worth showing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// Percentage, two decimals.
    pub percent: f64,
    pub elapsed: Duration,
    /// Linear extrapolation from elapsed time and percentage.
    pub remaining: Duration,
    /// MB/s since the previous report.
    pub throughput_mbps: f64,
    pub position: u64,
    pub total: u64,
    /// `position` in pages.
    pub current_page: u64,
    /// `total` in pages.
    pub total_pages: u64,
}

/// Progress state for one active transfer.
#[derive(Debug)]
pub struct ProgressReporter {
    page_size: u64,
    start: Instant,
    last_time: Instant,
    last_position: u64,
    /// Last reported percentage in hundredths of a percent.
    last_percent: Option<u32>,
}

impl ProgressReporter {
    pub fn new(page_size: u64) -> Self {
        let now = Instant::now();
        Self {
            page_size: page_size.max(1),
            start: now,
            last_time: now,
            last_position: 0,
            last_percent: None,
        }
    }

    pub fn update(&mut self, position: u64, total: u64) -> Option<ProgressReport> {
        self.update_at(position, total, Instant::now())
    }

    /// Same as [`ProgressReporter::update`] with an explicit clock reading.
    pub fn update_at(&mut self, position: u64, total: u64, now: Instant) -> Option<ProgressReport> {
        if total == 0 {
            return None;
        }
        let hundredths = percent_hundredths(position, total);

        if hundredths == 0 {
            // A new transfer starts: rebase timers and position.
            let repeated = self.last_percent == Some(0);
            self.start = now;
            self.last_time = now;
            self.last_position = position;
            self.last_percent = Some(0);
            if repeated {
                return None;
            }
            return Some(self.report(0, position, total, now, 0.0));
        }

        if self.last_percent.is_some_and(|last| hundredths <= last) {
            return None;
        }

        let dt = now.saturating_duration_since(self.last_time).as_secs_f64();
        let megabytes = position.saturating_sub(self.last_position) as f64 / 1024.0 / 1024.0;
        let throughput = if dt > 0.0 && megabytes != 0.0 {
            megabytes / dt
        } else {
            0.0
        };

        let report = self.report(hundredths, position, total, now, throughput);
        self.last_percent = Some(hundredths);
        self.last_position = position;
        self.last_time = now;
        Some(report)
    }

    fn report(
        &self,
        hundredths: u32,
        position: u64,
        total: u64,
        now: Instant,
        throughput_mbps: f64,
    ) -> ProgressReport {
        let elapsed = now.saturating_duration_since(self.start);
        let remaining = if hundredths > 0 && !elapsed.is_zero() {
            let estimated = elapsed.as_secs_f64() * 10_000.0 / hundredths as f64;
            Duration::from_secs_f64((estimated - elapsed.as_secs_f64()).max(0.0))
        } else {
            Duration::ZERO
        };

        ProgressReport {
            percent: hundredths as f64 / 100.0,
            elapsed,
            remaining,
            throughput_mbps,
            position,
            total,
            current_page: position / self.page_size,
            total_pages: total / self.page_size,
        }
    }
}

/// `position / total` in hundredths of a percent, rounded half up, capped at 100%.
fn percent_hundredths(position: u64, total: u64) -> u32 {
    let position = position.min(total) as u128;
    let total = total as u128;
    ((position * 20_000 + total) / (total * 2)) as u32
}

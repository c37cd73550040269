//! Sliding-window admission control for provider calls
//!
//! Two windows (one minute, one hour) of admitted-call timestamps. Each
//! check prunes expired timestamps before comparing against the budget.
//! The windows sit behind a plain mutex that is never held across an await,
//! independent of the generation lock.
//!
//! A poisoned lock makes the limiter fail open: calls are admitted and a
//! warning is logged. Operators should treat that warning as the limiter
//! being off.

use crate::config::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    Ok,
    MinuteLimit,
    HourLimit,
}

impl AdmissionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionReason::Ok => "ok",
            AdmissionReason::MinuteLimit => "minute_limit",
            AdmissionReason::HourLimit => "hour_limit",
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: AdmissionReason,
}

impl Admission {
    fn ok() -> Self {
        Self {
            allowed: true,
            reason: AdmissionReason::Ok,
        }
    }

    fn denied(reason: AdmissionReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Current window occupancy, for metrics endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub minute_used: usize,
    pub minute_budget: usize,
    pub hour_used: usize,
    pub hour_budget: usize,
    pub admission: Admission,
}

#[derive(Debug, Default)]
struct Windows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl Windows {
    fn prune(&mut self, now: Instant) {
        while self
            .minute
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= MINUTE)
        {
            self.minute.pop_front();
        }
        while self
            .hour
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            self.hour.pop_front();
        }
    }

    fn check(&self, per_minute: usize, per_hour: usize) -> Admission {
        if self.minute.len() >= per_minute {
            Admission::denied(AdmissionReason::MinuteLimit)
        } else if self.hour.len() >= per_hour {
            Admission::denied(AdmissionReason::HourLimit)
        } else {
            Admission::ok()
        }
    }

    fn record(&mut self, now: Instant) {
        self.minute.push_back(now);
        self.hour.push_back(now);
    }
}

pub struct RateLimiter {
    per_minute: usize,
    per_hour: usize,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            per_minute: config.per_minute,
            per_hour: config.per_hour,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn can_admit(&self) -> Admission {
        let Ok(mut windows) = self.windows.lock() else {
            warn!(target: "limiter", "Rate limiter lock poisoned; admitting (fail-open)");
            return Admission::ok();
        };
        windows.prune(Instant::now());
        windows.check(self.per_minute, self.per_hour)
    }

    pub fn record_admission(&self) {
        match self.windows.lock() {
            Ok(mut windows) => windows.record(Instant::now()),
            Err(_) => {
                warn!(target: "limiter", "Rate limiter lock poisoned; admission not recorded")
            }
        }
    }

    /// Check and record under one lock acquisition.
    pub fn try_admit(&self) -> Admission {
        let Ok(mut windows) = self.windows.lock() else {
            warn!(target: "limiter", "Rate limiter lock poisoned; admitting (fail-open)");
            return Admission::ok();
        };
        let now = Instant::now();
        windows.prune(now);
        let admission = windows.check(self.per_minute, self.per_hour);
        if admission.allowed {
            windows.record(now);
        }
        admission
    }

    /// Time until the next call would be admitted; `None` when admissible now.
    pub fn retry_after(&self) -> Option<Duration> {
        let Ok(mut windows) = self.windows.lock() else {
            return None;
        };
        let now = Instant::now();
        windows.prune(now);

        // The oldest entry that must expire for the window to drop below budget.
        let wait = |window: &VecDeque<Instant>, budget: usize, span: Duration| {
            if window.len() < budget {
                return None;
            }
            let idx = window.len() - budget;
            window
                .get(idx)
                .map(|t| span.saturating_sub(now.saturating_duration_since(*t)))
        };

        let minute = wait(&windows.minute, self.per_minute, MINUTE);
        let hour = wait(&windows.hour, self.per_hour, HOUR);
        match (minute, hour) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or_default().max(b.unwrap_or_default())),
        }
    }

    pub fn status(&self) -> RateLimitStatus {
        let admission = self.can_admit();
        let (minute_used, hour_used) = match self.windows.lock() {
            Ok(w) => (w.minute.len(), w.hour.len()),
            Err(_) => (0, 0),
        };
        RateLimitStatus {
            minute_used,
            minute_budget: self.per_minute,
            hour_used,
            hour_budget: self.per_hour,
            admission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: usize, per_hour: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            per_minute,
            per_hour,
        })
    }

    fn check_and_record(l: &RateLimiter) -> Admission {
        let a = l.can_admit();
        if a.allowed {
            l.record_admission();
        }
        a
    }

    #[tokio::test(start_paused = true)]
    async fn minute_budget_two_denies_third() {
        let l = limiter(2, 60);
        assert_eq!(check_and_record(&l), Admission::ok());
        assert_eq!(check_and_record(&l), Admission::ok());
        let third = check_and_record(&l);
        assert!(!third.allowed);
        assert_eq!(third.reason, AdmissionReason::MinuteLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_slides() {
        let l = limiter(2, 60);
        l.try_admit();
        l.try_admit();
        assert!(!l.can_admit().allowed);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!l.can_admit().allowed);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(l.can_admit().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn hour_budget_applies_after_minutes_pass() {
        let l = limiter(2, 3);
        assert!(l.try_admit().allowed);
        assert!(l.try_admit().allowed);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(l.try_admit().allowed);
        let denied = l.try_admit();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, AdmissionReason::HourLimit);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert!(l.try_admit().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_budget_in_trailing_minute() {
        let l = limiter(6, 60);
        let mut admitted = Vec::new();
        for _ in 0..300 {
            if l.try_admit().allowed {
                admitted.push(Instant::now());
            }
            tokio::time::advance(Duration::from_millis(700)).await;
        }
        for (i, t) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|u| u.duration_since(*t) < MINUTE)
                .count();
            assert!(in_window <= 6);
        }
        assert!(admitted.len() <= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_reports_oldest_expiry() {
        let l = limiter(2, 60);
        assert_eq!(l.retry_after(), None);
        l.try_admit();
        tokio::time::advance(Duration::from_secs(10)).await;
        l.try_admit();
        assert_eq!(l.retry_after(), Some(Duration::from_secs(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_usage() {
        let l = limiter(2, 10);
        l.try_admit();
        let s = l.status();
        assert_eq!(s.minute_used, 1);
        assert_eq!(s.hour_used, 1);
        assert_eq!(s.minute_budget, 2);
        assert!(s.admission.allowed);
    }

    #[test]
    fn poisoned_lock_fails_open() {
        let l = std::sync::Arc::new(limiter(1, 1));
        l.try_admit();
        let poisoner = std::sync::Arc::clone(&l);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.windows.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(l.can_admit().allowed);
        assert!(l.try_admit().allowed);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            /// Whatever the arrival pattern, no trailing minute holds more than
            /// the minute budget and no trailing hour more than the hour budget.
            #[test]
            fn admissions_respect_both_windows(
                per_minute in 1usize..8,
                per_hour in 1usize..40,
                gaps_ms in prop::collection::vec(0u64..120_000, 1..300),
            ) {
                let mut windows = Windows::default();
                let mut now = Instant::now();
                let mut admitted = Vec::new();
                for gap in gaps_ms {
                    now += Duration::from_millis(gap);
                    windows.prune(now);
                    if windows.check(per_minute, per_hour).allowed {
                        windows.record(now);
                        admitted.push(now);
                    }
                }

                for (i, t) in admitted.iter().enumerate() {
                    let later = &admitted[i..];
                    let in_minute = later.iter().take_while(|u| u.duration_since(*t) < MINUTE).count();
                    let in_hour = later.iter().take_while(|u| u.duration_since(*t) < HOUR).count();
                    prop_assert!(in_minute <= per_minute);
                    prop_assert!(in_hour <= per_hour);
                }
            }
        }
    }
}

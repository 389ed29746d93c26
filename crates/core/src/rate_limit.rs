//! Hourly per-user quota accounting.
//!
//! Every user owns at most one [`RateWindow`] per hour-aligned bucket. Consumption increments the
//! window while it is unblocked; reaching the role limit blocks it for the role's block duration.
//! A blocked window ignores consumption until `blocked_until` has passed, at which point the next
//! read or consumption releases it.
//!
//! The functions here are pure over an injected `now` so storage adapters can apply them inside a
//! transaction and tests can drive the clock.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRateLimit {
    pub max_requests_per_hour: u32,
    pub block_duration_minutes: u32,
    pub warning_threshold: u32,
}

impl RoleRateLimit {
    const fn new(max_requests_per_hour: u32, block_duration_minutes: u32, warning_threshold: u32) -> Self {
        Self { max_requests_per_hour, block_duration_minutes, warning_threshold }
    }

    pub fn near_limit_mark(&self) -> u32 {
        (u64::from(self.max_requests_per_hour) * u64::from(self.warning_threshold) / 100) as u32
    }
}

pub const DEFAULT_ROLE_RATE_LIMIT: RoleRateLimit = RoleRateLimit::new(20, 60, 90);

static ROLE_RATE_LIMITS: [(&str, RoleRateLimit); 8] = [
    ("SYS", RoleRateLimit::new(100, 15, 80)),
    ("ADM", RoleRateLimit::new(80, 20, 80)),
    ("JVE", RoleRateLimit::new(60, 30, 85)),
    ("VEN", RoleRateLimit::new(40, 30, 85)),
    ("REC", RoleRateLimit::new(50, 25, 85)),
    ("COB", RoleRateLimit::new(30, 45, 90)),
    ("SCO", RoleRateLimit::new(30, 45, 90)),
    ("FAC", RoleRateLimit::new(30, 45, 90)),
];

/// Unknown role codes fall back to the most conservative tier.
pub fn limits_for_role(role_code: &str) -> RoleRateLimit {
    let role_code = role_code.trim();
    ROLE_RATE_LIMITS
        .iter()
        .find(|(code, _)| *code == role_code)
        .map(|(_, limits)| *limits)
        .unwrap_or(DEFAULT_ROLE_RATE_LIMIT)
}

pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

pub fn next_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    window_start(now) + Duration::hours(1)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub user_id: UserId,
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Counted { request_count: u32, blocked: bool },
    Ignored { blocked_until: Option<DateTime<Utc>> },
}

impl RateWindow {
    pub fn open(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            window_start: window_start(now),
            request_count: 0,
            is_blocked: false,
            blocked_until: None,
        }
    }

    /// Clears an elapsed block. Returns true when the window changed.
    pub fn release_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_blocked {
            return false;
        }
        let expired = self.blocked_until.map(|until| now >= until).unwrap_or(true);
        if expired {
            self.is_blocked = false;
            self.blocked_until = None;
        }
        expired
    }

    pub fn consume(
        &mut self,
        points: u32,
        limits: &RoleRateLimit,
        now: DateTime<Utc>,
    ) -> ConsumeOutcome {
        self.release_if_expired(now);
        if self.is_blocked {
            return ConsumeOutcome::Ignored { blocked_until: self.blocked_until };
        }

        self.request_count = self.request_count.saturating_add(points);
        let blocked = self.request_count >= limits.max_requests_per_hour;
        if blocked {
            self.is_blocked = true;
            self.blocked_until =
                Some(now + Duration::minutes(i64::from(limits.block_duration_minutes)));
        }

        ConsumeOutcome::Counted { request_count: self.request_count, blocked }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
    pub warning_threshold: u32,
    pub is_near_limit: bool,
}

impl RateLimitStatus {
    /// Evaluates the current-hour window, treating an absent window as untouched.
    pub fn evaluate(
        window: Option<&RateWindow>,
        limits: &RoleRateLimit,
        now: DateTime<Utc>,
    ) -> Self {
        let mut window = window.cloned();
        if let Some(window) = window.as_mut() {
            window.release_if_expired(now);
        }

        let current = window.as_ref().map(|w| w.request_count).unwrap_or(0);
        let is_blocked = window.as_ref().map(|w| w.is_blocked).unwrap_or(false);
        let blocked_until = window.as_ref().and_then(|w| w.blocked_until);
        let limit = limits.max_requests_per_hour;

        Self {
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_time: next_window_start(now),
            is_blocked,
            blocked_until,
            warning_threshold: limits.warning_threshold,
            is_near_limit: current >= limits.near_limit_mark() && !is_blocked,
        }
    }

    pub fn allows(&self, points: u32) -> bool {
        !self.is_blocked && self.remaining >= points
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{
        limits_for_role, window_start, ConsumeOutcome, RateLimitStatus, RateWindow,
        DEFAULT_ROLE_RATE_LIMIT,
    };
    use crate::domain::user::UserId;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, hour, minute, 0).single().expect("valid timestamp")
    }

    #[test]
    fn role_table_falls_back_to_default() {
        assert_eq!(limits_for_role("SYS").max_requests_per_hour, 100);
        assert_eq!(limits_for_role(" VEN ").block_duration_minutes, 30);
        assert_eq!(limits_for_role("FAC").warning_threshold, 90);
        assert_eq!(limits_for_role("ven"), DEFAULT_ROLE_RATE_LIMIT);
        assert_eq!(limits_for_role("unknown"), DEFAULT_ROLE_RATE_LIMIT);
    }

    #[test]
    fn windows_align_to_the_hour() {
        assert_eq!(window_start(at(10, 47)), at(10, 0));
        let status = RateLimitStatus::evaluate(None, &limits_for_role("ADM"), at(10, 47));
        assert_eq!(status.reset_time, at(11, 0));
        assert_eq!(status.remaining, 80);
        assert!(status.allows(1));
    }

    #[test]
    fn reaching_limit_blocks_and_ignores_further_consumption() {
        let limits = limits_for_role("COB");
        let mut window = RateWindow::open(UserId("u-1".to_string()), at(9, 0));

        for _ in 0..14 {
            window.consume(2, &limits, at(9, 5));
        }
        assert!(!window.is_blocked);
        assert_eq!(window.request_count, 28);

        let outcome = window.consume(2, &limits, at(9, 10));
        assert_eq!(outcome, ConsumeOutcome::Counted { request_count: 30, blocked: true });
        assert_eq!(window.blocked_until, Some(at(9, 55)));

        let ignored = window.consume(2, &limits, at(9, 20));
        assert_eq!(ignored, ConsumeOutcome::Ignored { blocked_until: Some(at(9, 55)) });
        assert_eq!(window.request_count, 30);
    }

    #[test]
    fn blocked_window_is_released_after_block_duration() {
        let limits = limits_for_role("SYS");
        let mut window = RateWindow::open(UserId("u-1".to_string()), at(8, 0));
        window.consume(100, &limits, at(8, 1));

        let during = RateLimitStatus::evaluate(Some(&window), &limits, at(8, 10));
        assert!(during.is_blocked);
        assert!(!during.allows(1));
        assert!(!during.is_near_limit);

        let after = RateLimitStatus::evaluate(Some(&window), &limits, at(8, 16));
        assert!(!after.is_blocked);
        assert_eq!(after.remaining, 0);
        assert!(!after.allows(1));

        assert!(window.release_if_expired(at(8, 16)));
        assert!(!window.is_blocked);
        assert_eq!(window.blocked_until, None);
    }

    #[test]
    fn remaining_never_goes_negative_and_near_limit_uses_floor() {
        let limits = limits_for_role("VEN");
        assert_eq!(limits.near_limit_mark(), 34);

        let mut window = RateWindow::open(UserId("u-2".to_string()), at(12, 0));
        window.request_count = 33;
        let below = RateLimitStatus::evaluate(Some(&window), &limits, at(12, 30));
        assert!(!below.is_near_limit);
        assert_eq!(below.remaining, 7);

        window.request_count = 34;
        let near = RateLimitStatus::evaluate(Some(&window), &limits, at(12, 30));
        assert!(near.is_near_limit);

        window.request_count = 55;
        let over = RateLimitStatus::evaluate(Some(&window), &limits, at(12, 30));
        assert_eq!(over.remaining, 0);
    }

    #[test]
    fn block_expiry_boundary_is_inclusive() {
        let limits = limits_for_role("ADM");
        let mut window = RateWindow::open(UserId("u-3".to_string()), at(14, 0));
        window.consume(80, &limits, at(14, 0));
        let until = window.blocked_until.expect("blocked");
        assert_eq!(until, at(14, 20));

        assert!(!window.clone().release_if_expired(until - Duration::seconds(1)));
        assert!(window.release_if_expired(until));
    }
}

//! Per-user hourly quota service over the rate-window repository.
//!
//! Bookkeeping on the conversational path never fails a turn: [`RateLimiter::consume`] logs and
//! swallows storage errors. Status reads surface them.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::Span;

use concierge_core::domain::user::{User, UserId};
use concierge_core::errors::ApplicationError;
use concierge_core::rate_limit::{
    limits_for_role, window_start, ConsumeOutcome, RateLimitStatus, RoleRateLimit,
};
use concierge_db::repositories::{RateWindowRepository, RepositoryError};

use crate::clock::Clock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSummary {
    pub code: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitReport {
    pub success: bool,
    pub rate_limit_status: RateLimitStatus,
    pub user_role: RoleSummary,
    pub config: RoleRateLimit,
}

pub struct RateLimiter {
    windows: Arc<dyn RateWindowRepository>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl RateLimiter {
    pub fn new(windows: Arc<dyn RateWindowRepository>, clock: Arc<dyn Clock>, span: Span) -> Self {
        Self { windows, clock, span }
    }

    /// Current-hour status. An elapsed block is released and the release is persisted.
    pub async fn status(&self, user: &User) -> Result<RateLimitReport, ApplicationError> {
        let limits = limits_for_role(user.role_code());
        let now = self.clock.now();

        let mut window = self.windows.find(&user.id, window_start(now)).await.map_err(persistence)?;
        if let Some(current) = window.as_mut() {
            if current.release_if_expired(now) {
                self.windows.save(current.clone()).await.map_err(persistence)?;
                tracing::info!(
                    parent: &self.span,
                    event_name = "chat.rate_limit.released",
                    user_id = %user.id
                );
            }
        }

        let status = RateLimitStatus::evaluate(window.as_ref(), &limits, now);
        tracing::debug!(
            parent: &self.span,
            event_name = "chat.rate_limit.status",
            user_id = %user.id,
            role_code = user.role_code(),
            current = status.current,
            limit = status.limit
        );

        Ok(RateLimitReport {
            success: true,
            rate_limit_status: status,
            user_role: RoleSummary { code: user.role.code.clone(), name: user.role.name.clone() },
            config: limits,
        })
    }

    /// False when blocked, short on remaining points, or the status could not be read.
    pub async fn can_make_request(&self, user: &User, points: u32) -> bool {
        match self.status(user).await {
            Ok(report) => report.rate_limit_status.allows(points),
            Err(error) => {
                tracing::error!(
                    parent: &self.span,
                    event_name = "chat.rate_limit.check_failed",
                    user_id = %user.id,
                    error = %error,
                    "rate limit check failed, denying"
                );
                false
            }
        }
    }

    /// Charges `points` to the caller's current window. Storage failures are logged, never raised.
    pub async fn consume(&self, user: &User, points: u32) -> Option<ConsumeOutcome> {
        let limits = limits_for_role(user.role_code());
        match self.windows.consume(&user.id, points, &limits, self.clock.now()).await {
            Ok(outcome) => {
                match outcome {
                    ConsumeOutcome::Counted { request_count, blocked: true } => tracing::warn!(
                        parent: &self.span,
                        event_name = "chat.rate_limit.blocked",
                        user_id = %user.id,
                        request_count,
                        block_minutes = limits.block_duration_minutes,
                        "user reached hourly limit"
                    ),
                    ConsumeOutcome::Counted { request_count, blocked: false } => tracing::debug!(
                        parent: &self.span,
                        event_name = "chat.rate_limit.consumed",
                        user_id = %user.id,
                        points,
                        request_count
                    ),
                    ConsumeOutcome::Ignored { .. } => tracing::debug!(
                        parent: &self.span,
                        event_name = "chat.rate_limit.ignored",
                        user_id = %user.id,
                        points
                    ),
                }
                Some(outcome)
            }
            Err(error) => {
                tracing::error!(
                    parent: &self.span,
                    event_name = "chat.rate_limit.consume_failed",
                    user_id = %user.id,
                    points,
                    error = %error,
                    "rate limit bookkeeping failed"
                );
                None
            }
        }
    }

    /// Deletes windows that started more than an hour ago.
    pub async fn cleanup_expired(&self) -> Result<u64, ApplicationError> {
        let cutoff = self.clock.now() - Duration::hours(1);
        let deleted = self.windows.delete_before(cutoff).await.map_err(persistence)?;
        tracing::info!(parent: &self.span, event_name = "chat.rate_limit.cleanup", deleted);
        Ok(deleted)
    }

    pub async fn reset_user(&self, user_id: &UserId) -> Result<u64, ApplicationError> {
        let deleted = self.windows.delete_for_user(user_id).await.map_err(persistence)?;
        tracing::info!(
            parent: &self.span,
            event_name = "chat.rate_limit.reset",
            user_id = %user_id,
            deleted
        );
        Ok(deleted)
    }
}

fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

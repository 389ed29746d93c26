use std::sync::Arc;

use concierge_agent::rate_limiter::RateLimiter;
use concierge_agent::SystemClock;
use concierge_core::domain::user::{User, UserId, UserRole};
use concierge_db::repositories::SqlRateWindowRepository;
use concierge_db::DbPool;

use crate::commands::{
    block_on, load_config, migrated_pool, CommandResult, StepFailure, EXIT_DATABASE,
    EXIT_RUNTIME,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitsAction {
    Status { user_id: String, role: String },
    Cleanup,
    Reset { user_id: String },
}

pub fn run(action: LimitsAction) -> CommandResult {
    let config = match load_config("limits") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    block_on("limits", async {
        let pool = migrated_pool(&config).await?;
        let result = execute(&pool, action).await;
        pool.close().await;
        result
    })
}

async fn execute(pool: &DbPool, action: LimitsAction) -> Result<String, StepFailure> {
    let limiter = RateLimiter::new(
        Arc::new(SqlRateWindowRepository::new(pool.clone())),
        Arc::new(SystemClock),
        tracing::Span::none(),
    );

    match action {
        LimitsAction::Status { user_id, role } => {
            let user = operator_view_of(user_id, role);
            let report = limiter
                .status(&user)
                .await
                .map_err(|error| ("rate_limit_status", error.to_string(), EXIT_DATABASE))?;
            serde_json::to_string(&report)
                .map_err(|error| ("serialization", error.to_string(), EXIT_RUNTIME))
        }
        LimitsAction::Cleanup => {
            let removed = limiter
                .cleanup_expired()
                .await
                .map_err(|error| ("rate_limit_cleanup", error.to_string(), EXIT_DATABASE))?;
            Ok(format!("removed {removed} expired rate windows"))
        }
        LimitsAction::Reset { user_id } => {
            let removed = limiter
                .reset_user(&UserId(user_id.clone()))
                .await
                .map_err(|error| ("rate_limit_reset", error.to_string(), EXIT_DATABASE))?;
            Ok(format!("removed {removed} rate windows for {user_id}"))
        }
    }
}

/// Status reads only look at the id and role code.
fn operator_view_of(user_id: String, role: String) -> User {
    User {
        id: UserId(user_id),
        email: String::new(),
        first_name: String::new(),
        last_name: String::new(),
        full_name: None,
        role: UserRole { id: None, name: role.clone(), code: role },
    }
}

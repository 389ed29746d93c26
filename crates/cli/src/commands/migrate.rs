use concierge_db::migrations;

use crate::commands::{block_on, load_config, migrated_pool, CommandResult, EXIT_DATABASE};

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    block_on("migrate", async {
        let pool = migrated_pool(&config).await?;
        let applied = migrations::applied_count(&pool)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE));
        pool.close().await;
        Ok(format!("applied pending migrations ({} total)", applied?))
    })
}

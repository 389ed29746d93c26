use concierge_db::repositories::SqlContextRepository;
use concierge_db::DemoSeedDataset;

use crate::commands::{block_on, load_config, migrated_pool, CommandResult, EXIT_DATABASE};

/// Loads the demo role contexts, guides and access policies; with `reporting_demo` also rebuilds
/// the `projects` table in the configured reporting store.
pub fn run(reporting_demo: bool) -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    block_on("seed", async {
        let pool = migrated_pool(&config).await?;
        let repo = SqlContextRepository::new(pool.clone());

        let seeded = async {
            let loaded = DemoSeedDataset::load(&repo)
                .await
                .map_err(|error| ("seed_execution", error.to_string(), EXIT_DATABASE))?;
            let verification = DemoSeedDataset::verify(&repo)
                .await
                .map_err(|error| ("seed_verification", error.to_string(), EXIT_DATABASE))?;
            if !verification.all_passed {
                return Err((
                    "seed_verification",
                    verification_message(&verification.failed()),
                    EXIT_DATABASE,
                ));
            }
            Ok(loaded)
        }
        .await;
        pool.close().await;
        let loaded = seeded?;

        let mut message = format!(
            "demo context loaded: role contexts [{}], guides [{}], access policies [{}], \
             context base [{}], quick help [{}]",
            loaded.role_contexts.join(", "),
            loaded.guides.join(", "),
            loaded.access_policies.join(", "),
            loaded.context_base.join(", "),
            loaded.quick_help.join(", ")
        );

        if reporting_demo {
            let rows = DemoSeedDataset::build_reporting_store(&config.reporting.url)
                .await
                .map_err(|error| ("reporting_seed", error.to_string(), EXIT_DATABASE))?;
            message.push_str(&format!("; reporting store rebuilt with {rows} projects"));
        }

        Ok(message)
    })
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_error_message_targets_failed_checks() {
        assert_eq!(
            verification_message(&["policy:VEN", "guide:crear-usuario@ADM"]),
            "seed verification failed for checks: policy:VEN, guide:crear-usuario@ADM"
        );
        assert_eq!(verification_message(&[]), "some seed data failed to load");
    }
}

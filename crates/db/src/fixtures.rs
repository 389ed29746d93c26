use std::str::FromStr;

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Executor, SqlitePool};

use concierge_core::domain::context::{
    ContextBaseEntry, DatabaseAccessPolicy, QuickHelpSet, RoleContext, SystemGuide,
};

use crate::repositories::{ContextRepository, RepositoryError};

/// Guide keys the demo dataset promises, with the role each must be visible to.
const SEED_GUIDE_VISIBILITY: &[(&str, &str)] = &[
    ("crear-usuario", "ADM"),
    ("cambiar-contrasena", "VEN"),
    ("cambiar-contrasena", "COB"),
    ("consultar-proyectos", "VEN"),
];

const SEED_POLICY_ROLES: &[&str] = &["VEN", "ADM"];

const SEED_CONTEXT_BASE_KEYS: &[&str] = &["system", "limitations"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextSeed {
    role_contexts: Vec<RoleContext>,
    guides: Vec<SystemGuide>,
    access_policies: Vec<DatabaseAccessPolicy>,
    #[serde(default)]
    context_base: Vec<ContextBaseEntry>,
    #[serde(default)]
    quick_help: Vec<QuickHelpSet>,
}

/// Demo context entities (role contexts, guides, access policies, base entries, quick help),
/// plus a small reporting store.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const CONTEXT_JSON: &str = include_str!("../../../config/fixtures/context_seed.json");
    pub const REPORTING_SQL: &str = include_str!("../../../config/fixtures/reporting_demo.sql");

    fn parse() -> Result<ContextSeed, RepositoryError> {
        serde_json::from_str(Self::CONTEXT_JSON)
            .map_err(|error| RepositoryError::Decode(format!("context seed: {error}")))
    }

    /// Upserts every demo entity; running it twice leaves the same state.
    pub async fn load(repo: &dyn ContextRepository) -> Result<SeedResult, RepositoryError> {
        let seed = Self::parse()?;
        let mut result = SeedResult::default();

        for context in seed.role_contexts {
            result.role_contexts.push(context.role_code.clone());
            repo.upsert_role_context(context).await?;
        }
        for guide in seed.guides {
            result.guides.push(guide.key.clone());
            repo.upsert_guide(guide).await?;
        }
        for policy in seed.access_policies {
            result.access_policies.push(policy.role_code.clone());
            repo.upsert_access_policy(policy).await?;
        }
        for entry in seed.context_base {
            result.context_base.push(entry.key.clone());
            repo.upsert_context_base(entry).await?;
        }
        for set in seed.quick_help {
            result.quick_help.push(set.role_code.clone());
            repo.replace_quick_help(set).await?;
        }

        Ok(result)
    }

    pub async fn verify(repo: &dyn ContextRepository) -> Result<VerificationResult, RepositoryError> {
        let seed = Self::parse()?;
        let mut checks = Vec::new();

        for context in &seed.role_contexts {
            let found = repo.role_context(&context.role_code).await?;
            checks.push((format!("role-context:{}", context.role_code), found.is_some()));
        }

        for (key, role) in SEED_GUIDE_VISIBILITY {
            let visible =
                repo.guides_for_role(role).await?.iter().any(|guide| guide.key == *key);
            checks.push((format!("guide:{key}@{role}"), visible));
        }

        for role in SEED_POLICY_ROLES {
            let allows_projects = repo
                .access_policy(role)
                .await?
                .is_some_and(|policy| policy.allowed_tables.iter().any(|t| t == "projects"));
            checks.push((format!("policy:{role}"), allows_projects));
        }

        for key in SEED_CONTEXT_BASE_KEYS {
            checks.push((format!("context-base:{key}"), repo.context_base(key).await?.is_some()));
        }

        for set in &seed.quick_help {
            let stored = repo.quick_help_for_role(&set.role_code).await?;
            checks.push((
                format!("quick-help:{}", set.role_code),
                stored.len() == set.questions.len(),
            ));
        }

        Ok(VerificationResult::from_checks(checks))
    }

    /// Recreates the demo `projects` table in the reporting store at `url`.
    pub async fn build_reporting_store(url: &str) -> Result<i64, RepositoryError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePool::connect_with(options).await?;

        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::REPORTING_SQL)).await?;
        tx.commit().await?;

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM projects").fetch_one(&pool).await?;
        pool.close().await;
        Ok(rows)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedResult {
    pub role_contexts: Vec<String>,
    pub guides: Vec<String>,
    pub access_policies: Vec<String>,
    pub context_base: Vec<String>,
    pub quick_help: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub all_passed: bool,
    pub checks: Vec<(String, bool)>,
}

impl VerificationResult {
    fn from_checks(checks: Vec<(String, bool)>) -> Self {
        Self { all_passed: checks.iter().all(|(_, passed)| *passed), checks }
    }

    pub fn failed(&self) -> Vec<&str> {
        self.checks.iter().filter(|(_, passed)| !passed).map(|(name, _)| name.as_str()).collect()
    }
}

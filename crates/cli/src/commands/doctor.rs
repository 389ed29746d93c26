use concierge_agent::providers::build_client;
use concierge_core::config::{AppConfig, LoadOptions};
use concierge_db::{connect, migrations, SqliteRelationalStore};
use serde::Serialize;

use crate::commands::{CommandResult, EXIT_CONFIG, EXIT_DATABASE, EXIT_RUNTIME};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub details: String,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub overall_status: CheckStatus,
    pub summary: String,
    pub checks: Vec<DoctorCheck>,
}

const CHECKS_AFTER_CONFIG: [&str; 4] =
    ["completion_provider", "database_connectivity", "database_schema", "reporting_store"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = exit_code(&report);

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

pub fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_completion_provider(&config));
            checks.extend(check_stores(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(CHECKS_AFTER_CONFIG.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn exit_code(report: &DoctorReport) -> u8 {
    let failed = |name: &str| {
        report.checks.iter().any(|check| check.name == name && check.status == CheckStatus::Fail)
    };

    if report.overall_status == CheckStatus::Pass {
        0
    } else if failed("config_validation") || failed("completion_provider") {
        EXIT_CONFIG
    } else if failed("runtime_init") {
        EXIT_RUNTIME
    } else {
        EXIT_DATABASE
    }
}

fn check_completion_provider(config: &AppConfig) -> DoctorCheck {
    match build_client(&config.llm) {
        Ok(_) => DoctorCheck {
            name: "completion_provider",
            status: CheckStatus::Pass,
            details: format!("{:?} provider ready for model `{}`", config.llm.provider, config.llm.model),
        },
        Err(error) => DoctorCheck {
            name: "completion_provider",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_stores(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "runtime_init",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let mut checks = Vec::new();

        match connect(&config.database).await {
            Ok(pool) => {
                checks.push(DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Pass,
                    details: format!("connected using `{}`", config.database.url),
                });
                checks.push(check_schema(&pool).await);
                pool.close().await;
            }
            Err(error) => {
                checks.push(DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to connect to database: {error}"),
                });
                checks.push(DoctorCheck {
                    name: "database_schema",
                    status: CheckStatus::Skipped,
                    details: "skipped because the database is unreachable".to_string(),
                });
            }
        }

        checks.push(check_reporting_store(&config.reporting.url).await);
        checks
    })
}

async fn check_schema(pool: &concierge_db::DbPool) -> DoctorCheck {
    let expected = migrations::MIGRATOR.iter().filter(|m| m.migration_type.is_up_migration()).count();
    match migrations::applied_count(pool).await {
        Ok(applied) if applied as usize >= expected => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Pass,
            details: format!("{applied}/{expected} migrations applied"),
        },
        Ok(applied) => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Fail,
            details: format!("{applied}/{expected} migrations applied; run `concierge migrate`"),
        },
        Err(error) => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Fail,
            details: format!("could not read migration state: {error}"),
        },
    }
}

async fn check_reporting_store(url: &str) -> DoctorCheck {
    let reachable = match SqliteRelationalStore::new(url) {
        Ok(store) => store.ping().await,
        Err(error) => Err(error),
    };
    match reachable {
        Ok(()) => DoctorCheck {
            name: "reporting_store",
            status: CheckStatus::Pass,
            details: format!("reporting store reachable at `{url}`"),
        },
        Err(error) => DoctorCheck {
            name: "reporting_store",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

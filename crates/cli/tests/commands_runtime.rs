use std::env;
use std::sync::{Mutex, OnceLock};

use concierge_cli::commands::limits::LimitsAction;
use concierge_cli::commands::{config, doctor, limits, migrate, seed};
use serde_json::Value;
use tempfile::TempDir;

const ENV_KEYS: &[&str] = &[
    "CONCIERGE_DATABASE_URL",
    "CONCIERGE_DATABASE_MAX_CONNECTIONS",
    "CONCIERGE_DATABASE_TIMEOUT_SECS",
    "CONCIERGE_REPORTING_URL",
    "CONCIERGE_REPORTING_TIMEOUT_SECS",
    "CONCIERGE_LLM_PROVIDER",
    "CONCIERGE_LLM_API_KEY",
    "CLAUDE_API_KEY",
    "CONCIERGE_LLM_BASE_URL",
    "CONCIERGE_LLM_MODEL",
    "CONCIERGE_LLM_TIMEOUT_SECS",
    "CONCIERGE_LLM_MAX_RETRIES",
    "CONCIERGE_SERVER_BIND_ADDRESS",
    "CONCIERGE_SERVER_PORT",
    "PORT",
    "CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS",
    "CONCIERGE_SERVER_RATE_LIMIT_GC_INTERVAL_SECS",
    "CONCIERGE_CHAT_HISTORY_WINDOW",
    "CONCIERGE_LOGGING_LEVEL",
    "CONCIERGE_LOGGING_FORMAT",
    "CONCIERGE_LOG_LEVEL",
    "CONCIERGE_LOG_FORMAT",
];

struct Stores {
    _dir: TempDir,
    database_url: String,
    reporting_url: String,
}

fn stores() -> Stores {
    let dir = TempDir::new().expect("tempdir");
    let database_url = format!("sqlite://{}", dir.path().join("concierge.db").display());
    let reporting_url = format!("sqlite://{}", dir.path().join("reporting.db").display());
    Stores { _dir: dir, database_url, reporting_url }
}

fn valid_env(stores: &Stores) -> Vec<(&'static str, String)> {
    vec![
        ("CONCIERGE_DATABASE_URL", stores.database_url.clone()),
        ("CONCIERGE_REPORTING_URL", stores.reporting_url.clone()),
        ("CONCIERGE_LLM_API_KEY", "sk-ant-testsecret".to_string()),
    ]
}

#[test]
fn migrate_returns_success_with_valid_env() {
    let stores = stores();
    with_env(&valid_env(&stores), || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().contains("4 total"));
    });
}

#[test]
fn migrate_returns_config_failure_without_api_key() {
    let stores = stores();
    with_env(&[("CONCIERGE_DATABASE_URL", stores.database_url.clone())], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or_default().contains("llm.api_key"));
    });
}

#[test]
fn seed_loads_context_and_reporting_demo() {
    let stores = stores();
    with_env(&valid_env(&stores), || {
        let first = seed::run(true);
        assert_eq!(first.exit_code, 0, "seed failed: {}", first.output);
        let payload = parse_payload(&first.output);
        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("crear-usuario"));
        assert!(message.contains("VEN"));
        assert!(message.contains("rebuilt with 5 projects"));
        assert!(message.contains("context base [system, limitations]"));

        let again = seed::run(false);
        assert_eq!(again.exit_code, 0, "seed should be repeatable: {}", again.output);
        assert!(!parse_payload(&again.output)["message"]
            .as_str()
            .unwrap_or_default()
            .contains("reporting store"));
    });
}

#[test]
fn limits_status_reports_role_quota() {
    let stores = stores();
    with_env(&valid_env(&stores), || {
        let result = limits::run(LimitsAction::Status {
            user_id: "u-ven-1".to_string(),
            role: "VEN".to_string(),
        });
        assert_eq!(result.exit_code, 0, "limits status failed: {}", result.output);

        let payload = parse_payload(&result.output);
        let report: Value = serde_json::from_str(payload["message"].as_str().unwrap_or_default())
            .expect("status message should be a JSON report");
        assert_eq!(report["rateLimitStatus"]["limit"], 40);
        assert_eq!(report["rateLimitStatus"]["current"], 0);
        assert_eq!(report["config"]["blockDurationMinutes"], 30);
    });
}

#[test]
fn limits_cleanup_and_reset_succeed_on_empty_store() {
    let stores = stores();
    with_env(&valid_env(&stores), || {
        let cleanup = limits::run(LimitsAction::Cleanup);
        assert_eq!(cleanup.exit_code, 0, "cleanup failed: {}", cleanup.output);
        assert_eq!(parse_payload(&cleanup.output)["message"], "removed 0 expired rate windows");

        let reset = limits::run(LimitsAction::Reset { user_id: "u-1".to_string() });
        assert_eq!(reset.exit_code, 0, "reset failed: {}", reset.output);
        assert_eq!(parse_payload(&reset.output)["message"], "removed 0 rate windows for u-1");
    });
}

#[test]
fn config_redacts_api_key_and_attributes_sources() {
    let stores = stores();
    with_env(&valid_env(&stores), || {
        let result = config::run();
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let rendered = payload["message"].as_str().unwrap_or_default();
        assert!(!rendered.contains("testsecret"));
        assert!(rendered.contains("- llm.api_key = sk-ant-*** (source: env (CONCIERGE_LLM_API_KEY))"));
        assert!(rendered.contains("- chat.history_window = 5 (source: default)"));
    });
}

#[test]
fn doctor_passes_once_stores_are_prepared() {
    let stores = stores();
    with_env(&valid_env(&stores), || {
        let before = doctor::run(true);
        assert_eq!(before.exit_code, 4, "unmigrated stores should fail: {}", before.output);

        assert_eq!(migrate::run().exit_code, 0);
        assert_eq!(seed::run(true).exit_code, 0);

        let after = doctor::run(true);
        assert_eq!(after.exit_code, 0, "doctor should pass: {}", after.output);
        let report = parse_payload(&after.output);
        assert_eq!(report["overall_status"], "pass");
        assert_eq!(report["checks"].as_array().map(Vec::len), Some(5));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, String)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let previous_values: Vec<(&str, Option<String>)> =
        ENV_KEYS.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in ENV_KEYS {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}

//! Client-side statement guard applied before anything reaches the reporting store.

pub const SELECT_ONLY_MESSAGE: &str = "Solo se permiten consultas SELECT.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String },
}

/// Admits only statements whose trimmed, lower-cased text starts with `select`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatementGuard;

impl StatementGuard {
    pub fn evaluate(&self, sql: &str) -> GuardrailDecision {
        if sql.trim().to_lowercase().starts_with("select") {
            GuardrailDecision::Allow
        } else {
            GuardrailDecision::Deny {
                reason_code: "non_select_statement",
                user_message: SELECT_ONLY_MESSAGE.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GuardrailDecision, StatementGuard, SELECT_ONLY_MESSAGE};

    #[test]
    fn select_statements_are_allowed_in_any_case() {
        let guard = StatementGuard;
        assert_eq!(guard.evaluate("SELECT 1;"), GuardrailDecision::Allow);
        assert_eq!(guard.evaluate("  \n\tselect * from projects"), GuardrailDecision::Allow);
        assert_eq!(guard.evaluate("SeLeCt name FROM projects"), GuardrailDecision::Allow);
    }

    #[test]
    fn every_other_statement_is_denied() {
        let guard = StatementGuard;
        for sql in [
            "DELETE FROM projects;",
            "update projects set budget = 0",
            "INSERT INTO projects VALUES (1)",
            "WITH x AS (SELECT 1) SELECT * FROM x",
            "DROP TABLE projects",
            "",
            "-- SELECT\nDELETE FROM projects",
        ] {
            let decision = guard.evaluate(sql);
            let (reason_code, user_message) = match decision {
                GuardrailDecision::Deny { reason_code, user_message } => (reason_code, user_message),
                GuardrailDecision::Allow => ("", String::new()),
            };
            assert_eq!(reason_code, "non_select_statement", "statement: {sql}");
            assert_eq!(user_message, SELECT_ONLY_MESSAGE);
        }
    }
}

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRole {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: String,
    pub name: String,
}

/// Caller identity as handed over by the authenticating transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub role: UserRole,
}

impl User {
    pub fn display_name(&self) -> String {
        match self.full_name.as_deref().map(str::trim) {
            Some(full_name) if !full_name.is_empty() => full_name.to_string(),
            _ => format!("{} {}", self.first_name.trim(), self.last_name.trim()).trim().to_string(),
        }
    }

    pub fn role_code(&self) -> &str {
        self.role.code.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::{User, UserId, UserRole};

    fn user(full_name: Option<&str>) -> User {
        User {
            id: UserId("u-1".to_string()),
            email: "ana@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: "Pérez".to_string(),
            full_name: full_name.map(str::to_string),
            role: UserRole { id: None, code: " VEN ".to_string(), name: "Ventas".to_string() },
        }
    }

    #[test]
    fn display_name_prefers_full_name() {
        assert_eq!(user(Some("Ana María Pérez")).display_name(), "Ana María Pérez");
        assert_eq!(user(Some("  ")).display_name(), "Ana Pérez");
        assert_eq!(user(None).display_name(), "Ana Pérez");
    }

    #[test]
    fn deserializes_camel_case_payload() {
        let payload = serde_json::json!({
            "id": "u-9",
            "email": "leo@example.com",
            "firstName": "Leo",
            "lastName": "Soto",
            "role": { "code": "ADM", "name": "Administrador" }
        });

        let parsed: User = serde_json::from_value(payload).expect("user payload");
        assert_eq!(parsed.id, UserId("u-9".to_string()));
        assert_eq!(parsed.first_name, "Leo");
        assert_eq!(parsed.role_code(), "ADM");
        assert!(parsed.full_name.is_none());
    }
}

use std::sync::Arc;

use serde::Serialize;
use tracing::Span;

use concierge_core::domain::context::{
    ContextBaseEntry, DatabaseAccessPolicy, QuickHelpItem, QuickHelpSet, RoleContext, SystemGuide,
    UpsertAction,
};
use concierge_core::domain::user::User;
use concierge_core::errors::{ApplicationError, DomainError};
use concierge_db::repositories::ContextRepository;

use crate::sessions::persistence;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GuideListing {
    pub key: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AvailableGuides {
    pub success: bool,
    pub guides: Vec<GuideListing>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GuideDetail {
    pub success: bool,
    pub guide: SystemGuide,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuickHelpEntry {
    pub id: i64,
    pub question: String,
    pub order: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoleSummary {
    pub code: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickHelpView {
    pub success: bool,
    pub help: Vec<QuickHelpEntry>,
    pub user_role: RoleSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextBaseDetail {
    pub success: bool,
    pub context: ContextBaseEntry,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextBaseListing {
    pub success: bool,
    pub entries: Vec<ContextBaseEntry>,
}

/// Outcome of an administrative write, echoing the stored record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextUpdate<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
    pub action: UpsertAction,
}

fn require_text(field: &str, value: &str) -> Result<(), ApplicationError> {
    if value.trim().is_empty() {
        return Err(DomainError::InvariantViolation(format!("{field} must not be empty")).into());
    }
    Ok(())
}

/// Role contexts, guides, access policies, base instructions and quick help, with the
/// administrative upserts that maintain them.
pub struct ContextService {
    repo: Arc<dyn ContextRepository>,
    span: Span,
}

impl ContextService {
    pub fn new(repo: Arc<dyn ContextRepository>, span: Span) -> Self {
        Self { repo, span }
    }

    pub async fn role_context(&self, role_code: &str) -> Result<Option<RoleContext>, ApplicationError> {
        let context = self.repo.role_context(role_code).await.map_err(persistence)?;
        if context.is_none() {
            tracing::debug!(parent: &self.span, event_name = "context.role.missing", role_code);
        }
        Ok(context)
    }

    pub async fn guides_for_role(&self, role_code: &str) -> Result<Vec<SystemGuide>, ApplicationError> {
        self.repo.guides_for_role(role_code).await.map_err(persistence)
    }

    pub async fn guide_by_key(&self, key: &str) -> Result<Option<SystemGuide>, ApplicationError> {
        self.repo.guide_by_key(key).await.map_err(persistence)
    }

    /// The guide under `key`, provided it applies to `role_code`.
    pub async fn guide_for_role(
        &self,
        key: &str,
        role_code: &str,
    ) -> Result<GuideDetail, ApplicationError> {
        match self.guide_by_key(key).await? {
            Some(guide) if guide.applies_to(role_code) => Ok(GuideDetail { success: true, guide }),
            _ => Err(ApplicationError::ContextNotFound(format!(
                "Guía '{key}' no encontrada o no disponible para el rol {role_code}"
            ))),
        }
    }

    pub async fn available_guides(&self, role_code: &str) -> Result<AvailableGuides, ApplicationError> {
        let guides = self
            .guides_for_role(role_code)
            .await?
            .into_iter()
            .map(|guide| GuideListing { key: guide.key, title: guide.title, description: guide.description })
            .collect();
        Ok(AvailableGuides { success: true, guides })
    }

    pub async fn access_policy(
        &self,
        role_code: &str,
    ) -> Result<Option<DatabaseAccessPolicy>, ApplicationError> {
        self.repo.access_policy(role_code).await.map_err(persistence)
    }

    pub async fn quick_help(&self, user: &User) -> Result<QuickHelpView, ApplicationError> {
        let help = self
            .repo
            .quick_help_for_role(user.role_code())
            .await
            .map_err(persistence)?
            .into_iter()
            .map(|item| QuickHelpEntry { id: item.id, question: item.question, order: item.order })
            .collect();
        Ok(QuickHelpView {
            success: true,
            help,
            user_role: RoleSummary { code: user.role.code.clone(), name: user.role.name.clone() },
        })
    }

    pub async fn context_base(&self, key: &str) -> Result<ContextBaseDetail, ApplicationError> {
        match self.repo.context_base(key).await.map_err(persistence)? {
            Some(context) => Ok(ContextBaseDetail { success: true, context }),
            None => Err(ApplicationError::ContextNotFound(format!(
                "Context base con key '{key}' no encontrado"
            ))),
        }
    }

    pub async fn active_context_base(&self) -> Result<ContextBaseListing, ApplicationError> {
        let entries = self.repo.active_context_base().await.map_err(persistence)?;
        Ok(ContextBaseListing { success: true, entries })
    }

    pub async fn save_context_base(
        &self,
        entry: ContextBaseEntry,
    ) -> Result<ContextUpdate<ContextBaseEntry>, ApplicationError> {
        require_text("key", &entry.key)?;
        let action = self.repo.upsert_context_base(entry.clone()).await.map_err(persistence)?;
        let message = format!(
            "Context base con key '{}' {} exitosamente",
            entry.key,
            action.participle()
        );
        self.log_write("context_base", &entry.key, action);
        Ok(ContextUpdate { success: true, message, data: entry, action })
    }

    /// Replaces the role's quick help; the write always reports `created`.
    pub async fn save_quick_help(
        &self,
        set: QuickHelpSet,
    ) -> Result<ContextUpdate<Vec<QuickHelpItem>>, ApplicationError> {
        require_text("roleCode", &set.role_code)?;
        if set.questions.is_empty() {
            return Err(DomainError::InvariantViolation(
                "questions must contain at least one entry".to_string(),
            )
            .into());
        }
        for question in &set.questions {
            require_text("questions[]", question)?;
        }

        let role_code = set.role_code.clone();
        let items = self.repo.replace_quick_help(set).await.map_err(persistence)?;
        let action = UpsertAction::Created;
        self.log_write("quick_help", &role_code, action);
        Ok(ContextUpdate {
            success: true,
            message: format!("Quick Help para rol '{role_code}' creado exitosamente"),
            data: items,
            action,
        })
    }

    pub async fn save_guide(
        &self,
        guide: SystemGuide,
    ) -> Result<ContextUpdate<SystemGuide>, ApplicationError> {
        require_text("key", &guide.key)?;
        require_text("title", &guide.title)?;
        let action = self.repo.upsert_guide(guide.clone()).await.map_err(persistence)?;
        let message =
            format!("System Guide con key '{}' {} exitosamente", guide.key, action.participle());
        self.log_write("system_guide", &guide.key, action);
        Ok(ContextUpdate { success: true, message, data: guide, action })
    }

    pub async fn save_role_context(
        &self,
        context: RoleContext,
    ) -> Result<ContextUpdate<RoleContext>, ApplicationError> {
        require_text("roleCode", &context.role_code)?;
        require_text("name", &context.name)?;
        let action = self.repo.upsert_role_context(context.clone()).await.map_err(persistence)?;
        let message = format!(
            "Role Context para rol '{}' {} exitosamente",
            context.role_code,
            action.participle()
        );
        self.log_write("role_context", &context.role_code, action);
        Ok(ContextUpdate { success: true, message, data: context, action })
    }

    pub async fn save_access_policy(
        &self,
        policy: DatabaseAccessPolicy,
    ) -> Result<ContextUpdate<DatabaseAccessPolicy>, ApplicationError> {
        require_text("roleCode", &policy.role_code)?;
        let action = self.repo.upsert_access_policy(policy.clone()).await.map_err(persistence)?;
        let message = format!(
            "Database Access para rol '{}' {} exitosamente",
            policy.role_code,
            action.participle()
        );
        self.log_write("database_access", &policy.role_code, action);
        Ok(ContextUpdate { success: true, message, data: policy, action })
    }

    fn log_write(&self, entity: &str, key: &str, action: UpsertAction) {
        tracing::info!(
            parent: &self.span,
            event_name = "context.entity.saved",
            entity,
            key,
            action = action.participle(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing::Span;

    use concierge_core::domain::context::{ContextBaseEntry, QuickHelpSet, UpsertAction};
    use concierge_core::domain::user::{User, UserId, UserRole};
    use concierge_core::errors::ApplicationError;
    use concierge_db::repositories::InMemoryContextRepository;
    use concierge_db::DemoSeedDataset;

    use super::ContextService;

    fn seller() -> User {
        User {
            id: UserId("U-CTX-1".to_string()),
            email: "vendedor@example.com".to_string(),
            first_name: "Ana".to_string(),
            last_name: "Ruiz".to_string(),
            full_name: None,
            role: UserRole { id: None, code: "VEN".to_string(), name: "Vendedor".to_string() },
        }
    }

    async fn service() -> ContextService {
        let repo = Arc::new(InMemoryContextRepository::default());
        DemoSeedDataset::load(repo.as_ref()).await.expect("seed");
        ContextService::new(repo, Span::none())
    }

    #[tokio::test]
    async fn guides_are_scoped_to_role() {
        let service = service().await;

        let admin = service.available_guides("ADM").await.expect("guides");
        let keys: Vec<&str> = admin.guides.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys.first(), Some(&"crear-usuario"));
        assert!(keys.contains(&"cambiar-contrasena"));

        let seller = service.available_guides("VEN").await.expect("guides");
        assert!(seller.guides.iter().all(|g| g.key != "crear-usuario"));
    }

    #[tokio::test]
    async fn guide_for_role_rejects_foreign_and_unknown_keys() {
        let service = service().await;

        let detail = service.guide_for_role("crear-usuario", "ADM").await.expect("guide");
        assert_eq!(detail.guide.title, "Crear usuario");

        let error = service.guide_for_role("crear-usuario", "VEN").await.expect_err("hidden");
        assert_eq!(
            error,
            ApplicationError::ContextNotFound(
                "Guía 'crear-usuario' no encontrada o no disponible para el rol VEN".to_string()
            )
        );
        assert!(service.guide_for_role("nada", "ADM").await.is_err());
    }

    #[tokio::test]
    async fn policies_and_contexts_resolve_by_role() {
        let service = service().await;
        let policy = service.access_policy("VEN").await.expect("policy").expect("present");
        assert_eq!(policy.allowed_tables, vec!["projects".to_string()]);
        assert!(service.access_policy("COB").await.expect("policy").is_none());
        assert!(service.role_context("COB").await.expect("context").is_some());
        assert!(service.role_context("XYZ").await.expect("context").is_none());
    }

    #[tokio::test]
    async fn quick_help_lists_role_questions_in_order() {
        let service = service().await;
        let view = service.quick_help(&seller()).await.expect("quick help");
        assert!(view.success);
        assert_eq!(view.user_role.name, "Vendedor");
        let orders: Vec<u32> = view.help.iter().map(|entry| entry.order).collect();
        assert_eq!(orders, vec![1, 2]);

        let json = serde_json::to_value(&view).expect("json");
        assert_eq!(json["userRole"]["code"], "VEN");
        assert_eq!(json["help"][0]["question"], "¿Cuántos proyectos activos tengo?");
    }

    #[tokio::test]
    async fn saving_quick_help_replaces_previous_questions() {
        let service = service().await;
        let update = service
            .save_quick_help(QuickHelpSet {
                role_code: "VEN".to_string(),
                questions: vec!["¿Qué proyectos vencen este mes?".to_string()],
                keywords: Vec::new(),
            })
            .await
            .expect("save");
        assert_eq!(update.message, "Quick Help para rol 'VEN' creado exitosamente");
        assert_eq!(update.action, UpsertAction::Created);

        let view = service.quick_help(&seller()).await.expect("quick help");
        assert_eq!(view.help.len(), 1);
        assert_eq!(view.help[0].order, 1);

        let empty = service
            .save_quick_help(QuickHelpSet {
                role_code: "VEN".to_string(),
                questions: Vec::new(),
                keywords: Vec::new(),
            })
            .await
            .expect_err("no questions");
        assert!(matches!(empty, ApplicationError::Domain(_)));
    }

    #[tokio::test]
    async fn context_base_writes_report_their_action() {
        let service = service().await;
        let entry = ContextBaseEntry {
            key: "tone".to_string(),
            value: serde_json::json!("cordial"),
            description: None,
            is_active: true,
        };

        let created = service.save_context_base(entry.clone()).await.expect("create");
        assert_eq!(created.message, "Context base con key 'tone' creado exitosamente");
        let updated = service.save_context_base(entry).await.expect("update");
        assert_eq!(updated.message, "Context base con key 'tone' actualizado exitosamente");

        assert_eq!(service.context_base("tone").await.expect("get").context.value, "cordial");
        let missing = service.context_base("nope").await.expect_err("missing");
        assert_eq!(
            missing,
            ApplicationError::ContextNotFound("Context base con key 'nope' no encontrado".to_string())
        );

        let keys: Vec<String> = service
            .active_context_base()
            .await
            .expect("list")
            .entries
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec!["limitations", "system", "tone"]);
    }

    #[tokio::test]
    async fn seeded_role_context_save_is_an_update() {
        let service = service().await;
        let mut context =
            service.role_context("COB").await.expect("context").expect("seeded context");
        context.description = "Gestiona la cobranza".to_string();

        let update = service.save_role_context(context).await.expect("save");
        assert_eq!(update.action, UpsertAction::Updated);
        assert_eq!(update.message, "Role Context para rol 'COB' actualizado exitosamente");

        let blank = service
            .save_guide(concierge_core::domain::context::SystemGuide {
                key: " ".to_string(),
                title: "Sin clave".to_string(),
                applicable_roles: vec!["ALL".to_string()],
                steps: Vec::new(),
                description: None,
                priority: 0,
                is_active: true,
            })
            .await
            .expect_err("blank key");
        assert!(matches!(blank, ApplicationError::Domain(_)));
    }
}

use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use concierge_core::domain::context::{
    ContextBaseEntry, DatabaseAccessPolicy, QuickHelpItem, QuickHelpSet, RoleContext, SystemGuide,
};
use concierge_core::domain::session::SessionId;
use concierge_core::domain::user::{User, UserId};
use concierge_core::errors::ApplicationError;
use concierge_db::repositories::{ContextRepository, RateWindowRepository, SessionRepository};
use concierge_db::RelationalStore;

use crate::classifier::QueryClassifier;
use crate::clock::Clock;
use crate::context::{
    AvailableGuides, ContextBaseDetail, ContextBaseListing, ContextService, ContextUpdate,
    GuideDetail, QuickHelpView,
};
use crate::database_agent::DatabaseQueryAgent;
use crate::llm::CompletionClient;
use crate::orchestrator::{
    ConversationOrchestrator, OrchestratorParts, SendMessageResponse, DEFAULT_HISTORY_WINDOW,
};
use crate::rate_limiter::{RateLimitReport, RateLimiter};
use crate::sessions::{CommandAck, SessionHistory, SessionList, SessionService};
use crate::synthesizer::ResponseSynthesizer;
use crate::title::TitleGenerator;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RuntimeDependencies {
    pub sessions: Arc<dyn SessionRepository>,
    pub rate_windows: Arc<dyn RateWindowRepository>,
    pub context: Arc<dyn ContextRepository>,
    pub reporting: Arc<dyn RelationalStore>,
    pub completions: Arc<dyn CompletionClient>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub history_window: usize,
    /// Statement timeout when a policy sets none.
    pub query_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { history_window: DEFAULT_HISTORY_WINDOW, query_timeout: DEFAULT_QUERY_TIMEOUT }
    }
}

/// Entry point for every chat command. Owns the wired services; cheap to share behind an `Arc`.
pub struct AgentRuntime {
    orchestrator: ConversationOrchestrator,
    sessions: Arc<SessionService>,
    context: Arc<ContextService>,
    rate_limiter: Arc<RateLimiter>,
}

impl AgentRuntime {
    /// Wires every component, each with its own child of `span`.
    pub fn new(deps: RuntimeDependencies, settings: RuntimeSettings, span: Span) -> Self {
        let child = |name: &'static str| tracing::info_span!(parent: &span, "component", component = name);

        let sessions = Arc::new(SessionService::new(
            deps.sessions.clone(),
            deps.clock.clone(),
            child("sessions"),
        ));
        let context = Arc::new(ContextService::new(deps.context, child("context")));
        let rate_limiter = Arc::new(RateLimiter::new(
            deps.rate_windows,
            deps.clock.clone(),
            child("rate_limiter"),
        ));

        let parts = OrchestratorParts {
            sessions: deps.sessions,
            session_service: sessions.clone(),
            context: context.clone(),
            rate_limiter: rate_limiter.clone(),
            classifier: QueryClassifier::new(deps.completions.clone(), child("classifier")),
            titles: TitleGenerator::new(deps.completions.clone(), child("titles")),
            database_agent: DatabaseQueryAgent::new(
                deps.completions.clone(),
                deps.reporting,
                settings.query_timeout,
                child("database_agent"),
            ),
            synthesizer: ResponseSynthesizer::new(deps.completions, child("synthesizer")),
            clock: deps.clock,
        };
        let orchestrator =
            ConversationOrchestrator::new(parts, settings.history_window, child("orchestrator"));

        Self { orchestrator, sessions, context, rate_limiter }
    }

    pub async fn send_message(
        &self,
        user: &User,
        message: &str,
        session_id: Option<&SessionId>,
    ) -> Result<SendMessageResponse, ApplicationError> {
        self.orchestrator.handle_turn(user, message, session_id).await.map(SendMessageResponse::from)
    }

    pub async fn session_history(
        &self,
        user: &User,
        session_id: &SessionId,
    ) -> Result<SessionHistory, ApplicationError> {
        self.sessions.history(session_id, &user.id).await
    }

    pub async fn user_sessions(&self, user_id: &UserId) -> Result<SessionList, ApplicationError> {
        self.sessions.list(user_id).await
    }

    pub async fn close_session(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
    ) -> Result<CommandAck, ApplicationError> {
        self.sessions.close(session_id, user_id).await
    }

    pub async fn delete_session(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
    ) -> Result<CommandAck, ApplicationError> {
        self.sessions.delete(session_id, user_id).await
    }

    pub async fn rate_limit_status(&self, user: &User) -> Result<RateLimitReport, ApplicationError> {
        self.rate_limiter.status(user).await
    }

    pub async fn can_make_request(&self, user: &User, points: u32) -> bool {
        self.rate_limiter.can_make_request(user, points).await
    }

    pub async fn cleanup_expired_rate_limits(&self) -> Result<u64, ApplicationError> {
        self.rate_limiter.cleanup_expired().await
    }

    pub async fn reset_user_rate_limit(&self, user_id: &UserId) -> Result<u64, ApplicationError> {
        self.rate_limiter.reset_user(user_id).await
    }

    pub async fn available_guides(&self, user: &User) -> Result<AvailableGuides, ApplicationError> {
        self.context.available_guides(user.role_code()).await
    }

    pub async fn guide(&self, user: &User, key: &str) -> Result<GuideDetail, ApplicationError> {
        self.context.guide_for_role(key, user.role_code()).await
    }

    pub async fn quick_help(&self, user: &User) -> Result<QuickHelpView, ApplicationError> {
        self.context.quick_help(user).await
    }

    pub async fn context_base(&self, key: &str) -> Result<ContextBaseDetail, ApplicationError> {
        self.context.context_base(key).await
    }

    pub async fn active_context_base(&self) -> Result<ContextBaseListing, ApplicationError> {
        self.context.active_context_base().await
    }

    pub async fn save_context_base(
        &self,
        entry: ContextBaseEntry,
    ) -> Result<ContextUpdate<ContextBaseEntry>, ApplicationError> {
        self.context.save_context_base(entry).await
    }

    pub async fn save_quick_help(
        &self,
        set: QuickHelpSet,
    ) -> Result<ContextUpdate<Vec<QuickHelpItem>>, ApplicationError> {
        self.context.save_quick_help(set).await
    }

    pub async fn save_guide(
        &self,
        guide: SystemGuide,
    ) -> Result<ContextUpdate<SystemGuide>, ApplicationError> {
        self.context.save_guide(guide).await
    }

    pub async fn save_role_context(
        &self,
        context: RoleContext,
    ) -> Result<ContextUpdate<RoleContext>, ApplicationError> {
        self.context.save_role_context(context).await
    }

    pub async fn save_access_policy(
        &self,
        policy: DatabaseAccessPolicy,
    ) -> Result<ContextUpdate<DatabaseAccessPolicy>, ApplicationError> {
        self.context.save_access_policy(policy).await
    }
}

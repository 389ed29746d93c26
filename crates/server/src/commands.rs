//! Command-dispatch surface.
//!
//! Every chat command arrives as `POST /commands/{command}` with a camelCase JSON payload and
//! answers with the command's response object. Failures answer with
//! `{status, success: false, message, error}`; the correlation id travels in `x-correlation-id`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use concierge_agent::AgentRuntime;
use concierge_core::domain::session::SessionId;
use concierge_core::domain::user::{User, UserId};
use concierge_core::errors::ApplicationError;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const UNKNOWN_COMMAND_MESSAGE: &str = "Comando desconocido";
pub const INVALID_PAYLOAD_MESSAGE: &str = "Solicitud inválida";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatCommand {
    SendMessage,
    SessionHistory,
    UserSessions,
    CloseSession,
    DeleteSession,
    RateLimitStatus,
    CanMakeRequest,
    AvailableGuides,
    GuideDetail,
    QuickHelp,
    CreateContextBase,
    ContextBaseDetail,
    ContextBaseListing,
    CreateQuickHelp,
    CreateSystemGuide,
    CreateRoleContext,
    CreateDatabaseAccess,
}

impl ChatCommand {
    pub const ALL: [ChatCommand; 17] = [
        Self::SendMessage,
        Self::SessionHistory,
        Self::UserSessions,
        Self::CloseSession,
        Self::DeleteSession,
        Self::RateLimitStatus,
        Self::CanMakeRequest,
        Self::AvailableGuides,
        Self::GuideDetail,
        Self::QuickHelp,
        Self::CreateContextBase,
        Self::ContextBaseDetail,
        Self::ContextBaseListing,
        Self::CreateQuickHelp,
        Self::CreateSystemGuide,
        Self::CreateRoleContext,
        Self::CreateDatabaseAccess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "chatbot.send.message",
            Self::SessionHistory => "chatbot.session.get-history",
            Self::UserSessions => "chatbot.sessions.get-all",
            Self::CloseSession => "chatbot.session.close",
            Self::DeleteSession => "chatbot.session.delete",
            Self::RateLimitStatus => "chatbot.rate-limit.status",
            Self::CanMakeRequest => "chatbot.rate-limit.can-request",
            Self::AvailableGuides => "chatbot.guides.available",
            Self::GuideDetail => "chatbot.guide.get",
            Self::QuickHelp => "chatbot.quick-help",
            Self::CreateContextBase => "context.base.create",
            Self::ContextBaseDetail => "context.base.get",
            Self::ContextBaseListing => "context.base.list",
            Self::CreateQuickHelp => "context.quick-help.create",
            Self::CreateSystemGuide => "context.system-guide.create",
            Self::CreateRoleContext => "context.role-context.create",
            Self::CreateDatabaseAccess => "context.database-access.create",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.as_str() == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub user: User,
    pub message: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryPayload {
    pub user: User,
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct UserSessionsPayload {
    pub id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActionPayload {
    pub user_id: UserId,
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct CanRequestPayload {
    pub user: User,
    #[serde(default = "default_points")]
    pub points: u32,
}

fn default_points() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct GuidePayload {
    pub user: User,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextKeyPayload {
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub status: u16,
    pub success: bool,
    pub message: String,
    pub error: String,
}

#[derive(Clone)]
pub struct CommandState {
    runtime: Arc<AgentRuntime>,
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new().route("/commands/{command}", post(dispatch)).with_state(CommandState { runtime })
}

enum CommandFailure {
    Payload(serde_json::Error),
    Application(ApplicationError),
}

impl From<ApplicationError> for CommandFailure {
    fn from(error: ApplicationError) -> Self {
        Self::Application(error)
    }
}

async fn dispatch(
    State(state): State<CommandState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("command", command = %name, correlation_id = %correlation_id);

    let Some(command) = ChatCommand::parse(&name) else {
        warn!(
            parent: &span,
            event_name = "server.command.unknown",
            "rejecting unknown command"
        );
        let failure = CommandError {
            status: StatusCode::NOT_FOUND.as_u16(),
            success: false,
            message: UNKNOWN_COMMAND_MESSAGE.to_string(),
            error: format!("unknown command `{name}`"),
        };
        return respond(StatusCode::NOT_FOUND, &correlation_id, failure);
    };

    let outcome = execute(&state.runtime, command, &body).instrument(span.clone()).await;
    match outcome {
        Ok(response) => {
            info!(parent: &span, event_name = "server.command.completed", "command completed");
            with_correlation(response, &correlation_id)
        }
        Err(failure) => {
            let (status, error) = render_failure(failure, &correlation_id);
            if status.is_server_error() {
                tracing::error!(
                    parent: &span,
                    event_name = "server.command.failed",
                    status = status.as_u16(),
                    error = %error.error,
                    "command failed"
                );
            } else {
                warn!(
                    parent: &span,
                    event_name = "server.command.rejected",
                    status = status.as_u16(),
                    error = %error.error,
                    "command rejected"
                );
            }
            respond(status, &correlation_id, error)
        }
    }
}

async fn execute(
    runtime: &AgentRuntime,
    command: ChatCommand,
    body: &[u8],
) -> Result<Response, CommandFailure> {
    let response = match command {
        ChatCommand::SendMessage => {
            let payload: SendMessagePayload = payload(body)?;
            let sent = runtime
                .send_message(&payload.user, &payload.message, payload.session_id.as_ref())
                .await?;
            Json(sent).into_response()
        }
        ChatCommand::SessionHistory => {
            let payload: SessionHistoryPayload = payload(body)?;
            Json(runtime.session_history(&payload.user, &payload.session_id).await?).into_response()
        }
        ChatCommand::UserSessions => {
            let payload: UserSessionsPayload = payload(body)?;
            Json(runtime.user_sessions(&payload.id).await?).into_response()
        }
        ChatCommand::CloseSession => {
            let payload: SessionActionPayload = payload(body)?;
            Json(runtime.close_session(&payload.user_id, &payload.session_id).await?).into_response()
        }
        ChatCommand::DeleteSession => {
            let payload: SessionActionPayload = payload(body)?;
            Json(runtime.delete_session(&payload.user_id, &payload.session_id).await?)
                .into_response()
        }
        ChatCommand::RateLimitStatus => {
            let payload: UserPayload = payload(body)?;
            Json(runtime.rate_limit_status(&payload.user).await?).into_response()
        }
        ChatCommand::CanMakeRequest => {
            let payload: CanRequestPayload = payload(body)?;
            Json(runtime.can_make_request(&payload.user, payload.points).await).into_response()
        }
        ChatCommand::AvailableGuides => {
            let payload: UserPayload = payload(body)?;
            Json(runtime.available_guides(&payload.user).await?).into_response()
        }
        ChatCommand::GuideDetail => {
            let payload: GuidePayload = payload(body)?;
            Json(runtime.guide(&payload.user, &payload.key).await?).into_response()
        }
        ChatCommand::QuickHelp => {
            let payload: UserPayload = payload(body)?;
            Json(runtime.quick_help(&payload.user).await?).into_response()
        }
        ChatCommand::CreateContextBase => {
            Json(runtime.save_context_base(payload(body)?).await?).into_response()
        }
        ChatCommand::ContextBaseDetail => {
            let payload: ContextKeyPayload = payload(body)?;
            Json(runtime.context_base(&payload.key).await?).into_response()
        }
        ChatCommand::ContextBaseListing => {
            Json(runtime.active_context_base().await?).into_response()
        }
        ChatCommand::CreateQuickHelp => {
            Json(runtime.save_quick_help(payload(body)?).await?).into_response()
        }
        ChatCommand::CreateSystemGuide => {
            Json(runtime.save_guide(payload(body)?).await?).into_response()
        }
        ChatCommand::CreateRoleContext => {
            Json(runtime.save_role_context(payload(body)?).await?).into_response()
        }
        ChatCommand::CreateDatabaseAccess => {
            Json(runtime.save_access_policy(payload(body)?).await?).into_response()
        }
    };
    Ok(response)
}

fn payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, CommandFailure> {
    serde_json::from_slice(body).map_err(CommandFailure::Payload)
}

fn render_failure(failure: CommandFailure, correlation_id: &str) -> (StatusCode, CommandError) {
    match failure {
        CommandFailure::Payload(error) => (
            StatusCode::BAD_REQUEST,
            CommandError {
                status: StatusCode::BAD_REQUEST.as_u16(),
                success: false,
                message: INVALID_PAYLOAD_MESSAGE.to_string(),
                error: error.to_string(),
            },
        ),
        CommandFailure::Application(error) => {
            let interface = error.into_interface(correlation_id);
            let status = StatusCode::from_u16(interface.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                CommandError {
                    status: status.as_u16(),
                    success: false,
                    message: interface.user_message().to_string(),
                    error: interface.detail().to_string(),
                },
            )
        }
    }
}

fn respond(status: StatusCode, correlation_id: &str, error: CommandError) -> Response {
    with_correlation((status, Json(error)).into_response(), correlation_id)
}

fn with_correlation(mut response: Response, correlation_id: &str) -> Response {
    if let Ok(value) = correlation_id.parse() {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

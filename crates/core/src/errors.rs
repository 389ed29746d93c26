use thiserror::Error;

pub const SESSION_NOT_FOUND_MESSAGE: &str = "Sesión no encontrada o no pertenece al usuario";
pub const SESSION_NOT_OPEN_MESSAGE: &str = "Sesión no encontrada o ya está cerrada";
pub const PROCESSING_FAILED_MESSAGE: &str = "Error al procesar el mensaje";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown message role `{0}`")]
    UnknownMessageRole(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("session `{session_id}` not found")]
    SessionNotFound { session_id: String },
    #[error("session `{session_id}` does not belong to user `{user_id}`")]
    SessionMismatch { session_id: String, user_id: String },
    #[error("session `{session_id}` is not open")]
    SessionNotOpen { session_id: String },
    #[error("{0}")]
    ContextNotFound(String),
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("bad request: {message}")]
    BadRequest { message: String, detail: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::BadRequest { .. } => 400,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn user_message(&self) -> &str {
        match self {
            Self::NotFound { message, .. } | Self::BadRequest { message, .. } => message,
            Self::ServiceUnavailable { .. } => {
                "El servicio no está disponible temporalmente. Intenta de nuevo en unos momentos."
            }
            Self::Internal { .. } => "Ocurrió un error interno inesperado.",
        }
    }

    /// Underlying failure text, safe to log but not meant as user copy.
    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest { detail, .. } => detail,
            Self::NotFound { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::NotFound { correlation_id, .. }
            | Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::SessionNotFound { .. } | ApplicationError::SessionMismatch { .. } => {
                Self::NotFound {
                    message: SESSION_NOT_FOUND_MESSAGE.to_owned(),
                    correlation_id: unassigned(),
                }
            }
            ApplicationError::SessionNotOpen { .. } => Self::NotFound {
                message: SESSION_NOT_OPEN_MESSAGE.to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::ContextNotFound(message) => {
                Self::NotFound { message, correlation_id: unassigned() }
            }
            ApplicationError::ProcessingFailed(detail) => Self::BadRequest {
                message: PROCESSING_FAILED_MESSAGE.to_owned(),
                detail,
                correlation_id: unassigned(),
            },
            ApplicationError::Domain(error) => Self::BadRequest {
                message: "La solicitud no es válida.".to_owned(),
                detail: error.to_string(),
                correlation_id: unassigned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

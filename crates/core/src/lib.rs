//! Concierge core: domain model, per-role rate accounting, configuration and the error taxonomy
//! shared by the storage, agent and interface crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod rate_limit;

pub use domain::context::{DatabaseAccessPolicy, QueryLimits, RoleContext, SystemGuide};
pub use domain::message::{ChatMessage, MessageId, MessageRole, QueryType};
pub use domain::session::{Session, SessionId, SessionSummary};
pub use domain::user::{User, UserId, UserRole};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use rate_limit::{RateLimitStatus, RateWindow, RoleRateLimit};

pub mod context;
pub mod message;
pub mod session;
pub mod user;

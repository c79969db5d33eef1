//! Gateway server implementation

pub mod auth;
mod email;
mod router;
mod server;

pub use auth::{AuthStatus, Authentication, Gate};
pub use email::EmailValidator;
pub use router::{AppState, create_router};
pub use server::Gateway;

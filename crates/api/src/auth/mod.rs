//! Authentication module for Teranga

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager, ROLE_ADMIN, ROLE_USER};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};

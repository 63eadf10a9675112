//! Sign-in, sessions and password lifecycle.

pub mod password;
mod service;
pub mod tokens;

pub use service::{AuthService, LoginRequest, LoginResponse, TokenBundle, UserProfile};
pub use tokens::{IssuedToken, TokenClaims, TokenService, TokenType};

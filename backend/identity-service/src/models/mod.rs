/// Data models for identity and authentication
pub mod token;
pub mod user;

pub use token::{
    kinds, Token, TokenFilter, TokenStatus, TokenStatusFilter, TokenType, TokenTypeFilter,
};
pub use user::{Cart, CartFilter, Role, RoleFilter, User, UserFilter, UserSession};

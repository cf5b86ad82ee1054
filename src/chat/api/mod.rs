//! REST side of the chat backend.
//!
//! - [`ChatBackend`]: the operations the client consumes, as a trait seam
//! - [`HttpChatApi`]: bearer-authenticated reqwest implementation
//! - [`AuthService`]: token validation and logout

pub mod auth;
pub mod client;
pub mod dto;
pub(crate) mod http;

pub use auth::{Account, AuthContext, AuthService};
pub use client::{ChatBackend, HttpChatApi};

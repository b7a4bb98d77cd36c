//! m365-mcp: Microsoft 365 Graph tools backed by a managed Azure AD session.
//!
//! The [`auth::CredentialBroker`] owns the session and hands out access
//! tokens; the [`graph::GraphClient`] executes Graph requests with paging,
//! throttling and re-authentication; the [`tools::ToolRegistry`] exposes
//! both as named JSON tools for a host process.

#![deny(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod graph;
pub mod retry;
pub mod settings;
pub mod store;
pub mod tools;

pub use error::{AppError, ErrorCategory};

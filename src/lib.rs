//! Stash: a multi-client file exchange server
//!
//! Clients speak a small length-prefixed protocol over TCP to register,
//! log in, and manage files inside a per-user directory on the server.

pub mod accounts;
pub mod auth;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod file_store;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod transfer;

pub use server::{Server, ServerContext, ShutdownHandle};

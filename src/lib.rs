//! code-interpreter-proxy library
//!
//! This crate provides the core of the code interpreter proxy:
//! - Session lifecycle: one sandbox per session id, serialized runs, TTL expiry
//! - Output detection by diffing the sandbox working directory
//! - Per-session file storage with quotas
//! - Sandbox runtimes (Docker CLI, host processes) behind a registry
//! - MCP server implementation using rmcp

pub mod config;
pub mod error;
pub mod language;
pub mod manager;
pub mod mcp;
pub mod runtime;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod sweeper;

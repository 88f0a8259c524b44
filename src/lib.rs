//! oi-sandbox library
//!
//! Sandboxed C++ build-and-execute engine for online-judge style tooling:
//! - Workspace, path and command confinement (`sandbox`)
//! - Resource-limited process execution (`sandbox::ResourceLimiter`)
//! - Compile, run, debug and compare orchestration (`engine`)
//! - Configuration loading (`config`)
//! - MCP server implementation using rmcp (`mcp`)

pub mod config;
pub mod engine;
pub mod error;
pub mod mcp;
pub mod sandbox;

pub use error::{EngineError, Result};

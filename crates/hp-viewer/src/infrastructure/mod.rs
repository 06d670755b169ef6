//! Infrastructure layer of the viewer host.
//!
//! Contains the adapters behind the application ports: configuration and
//! protocol files on disk, an in-memory display set source, a recording
//! renderer and tool runtime, the tracing notification sink, the tokio
//! scheduler for deferred work, and the JSON command bridge.
//!
//! **Dependency rule**: this layer may depend on `application` and `hp_core`,
//! but MUST NOT be imported by the `application` or domain layers.

pub mod command_bridge;
pub mod display_sets;
pub mod notifications;
pub mod scheduler;
pub mod storage;
pub mod viewport_service;

//! # libarstor: CSI over QUIC for ArStor arrays
//!
//! `libarstor` provisions volumes and snapshots as files on an ArStor array
//! share, exposes them to Pods through loop devices, and serves the
//! [Container Storage Interface][csi] over QUIC (via [`quinn`]).  It follows
//! the RK8s conventions: Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `Snapshot`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume and snapshot lifecycle. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage, expand. |
//! | [`config`] | [`ArStorConfig`](config::ArStorConfig) plugin settings. |
//! | [`backoff`] | Readiness polling schedule. |
//! | [`exec`] | External command seam (`losetup`, `blkid`, `docker`, ...). |
//! | [`tool`] | The array tool: create, snapshot, clone, delete, directory dumps. |
//! | [`allocator`] | Hash-sharded directory placement with full-shard tracking. |
//! | [`catalog`] | In-memory index rebuilt by scanning the namespace. |
//! | [`engine`] | Multi-step volume and snapshot operations with rollback. |
//! | [`loopdev`] | Loop device bindings and the lost-device sweep. |
//! | [`mounter`] | Format detection, mkfs, mounts, filesystem resize. |
//! | [`backend`] | The ArStor backend implementing all three services. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod allocator;
pub mod backend;
pub mod backoff;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod exec;
pub mod identity;
pub mod loopdev;
pub mod message;
pub mod mounter;
pub mod node;
pub mod tool;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::arstor::ArStorBackend;
pub use config::ArStorConfig;
pub use controller::CsiController;
pub use engine::VolumeEngine;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;

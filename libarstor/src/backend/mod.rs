//! Storage backend implementations.
//!
//! Each backend module provides a concrete type that implements
//! [`CsiIdentity`](crate::identity::CsiIdentity),
//! [`CsiController`](crate::controller::CsiController), and
//! [`CsiNode`](crate::node::CsiNode).

pub mod arstor;

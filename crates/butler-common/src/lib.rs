//! Shared types and utilities for the Butler bootstrap tooling
//!
//! This crate provides:
//! - The error taxonomy shared by every bootstrap phase
//! - A cancellable run context and the single poll-until helper
//! - Kubernetes utilities (client factory, dynamic object store, manifest parsing)
//! - Typed ProviderConfig and ClusterBootstrap resources

#![deny(missing_docs)]

pub mod context;
pub mod crd;
pub mod error;
pub mod kube_utils;

pub use context::{poll_until, RunContext};
pub use error::{Error, Result};

/// Namespace the Butler controllers and intent objects live in
pub const BUTLER_NAMESPACE: &str = "butler-system";

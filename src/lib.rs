//! eks-harness - lifecycle driver for ephemeral managed Kubernetes clusters
//!
//! Provisions cloud infrastructure (network, IAM, encryption key, SSH key,
//! control plane, node groups), installs a configurable set of add-ons,
//! exercises them against the running cluster, exports artifacts, and tears
//! everything down again on success, failure or interrupt.
//!
//! # Architecture
//!
//! A single YAML configuration document is both the input and the record of
//! what exists. Every component mutates it through [`config::Store`], which
//! flushes to disk on each change, so `Down` can always find what `Up`
//! created, even after a crash.
//!
//! # Modules
//!
//! - [`config`] - Configuration document, validation, persistent store
//! - [`provider`] - Narrow cloud provider facade and its CLI-backed implementation
//! - [`poller`] - Generic "wait until a resource reaches a state" primitive
//! - [`stack`] - Declarative template stack driver
//! - [`cluster`] - Control plane driver, OIDC, bearer tokens, kubeconfig
//! - [`nodegroup`] - Self-managed and provider-managed worker pools
//! - [`addons`] - Add-on contract, registry and plugin shapes
//! - [`health`] - Control plane health checker
//! - [`artifacts`] - Artifact exporter to the object store
//! - [`reaper`] - Load balancer reaper for out-of-band controller leftovers
//! - [`orchestrator`] - Top-level `Up` / `Down` state machine
//! - [`abort`] - Stop signal and abortable waits
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod abort;
pub mod addons;
pub mod artifacts;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod k8s;
pub mod nodegroup;
pub mod orchestrator;
pub mod poller;
pub mod provider;
pub mod reaper;
pub mod retry;
pub mod ssh;
pub mod stack;
pub mod telemetry;
pub mod template;
pub mod tools;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "eks-harness";

/// Metadata `Kind` value attached to every uploaded artifact
pub const ARTIFACT_KIND: &str = "aws-k8s-tester";

/// Default region when the document does not name one
pub const DEFAULT_REGION: &str = "us-west-2";

/// Default Kubernetes version
pub const DEFAULT_VERSION: &str = "1.30";

/// Number of sequential add-ons between health checks and artifact uploads
pub const HEALTH_CHECK_EVERY: usize = 10;

//! Integration tests for the operation cache operator
//!
//! These tests require a Kubernetes cluster (kind) and tell the story of how
//! tenants interact with the operation cache CRDs through the API server.
//!
//! - `crd_operations`: creating, reading, and validating Requirements,
//!   Caches, and Operations
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod helpers;

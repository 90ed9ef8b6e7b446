//! ssp-operator: reconciles the KubeVirt SSP custom resource.
//!
//! The library holds everything but process bootstrap so integration tests
//! can drive the engine and the admission rules against an in-memory
//! cluster.

pub mod admission;
pub mod bundle;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod error;
pub mod fingerprint;
pub mod helpers;
pub mod registry;
pub mod webhook;

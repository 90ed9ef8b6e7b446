//! Integration tests driving the reconciliation engine against the
//! in-memory cluster.
//!
//! Each submodule tests a specific area of concern. The shared harness and
//! helpers live in `common.rs`.
//!
//! Run with: `cargo test --test integration`

mod common;

mod common_templates;
mod engine;
mod template_validator;

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};

// ── Operator configuration (injected via CLI flags / env) ─────────────────────

/// Cluster-specific configuration collected at startup from CLI flags.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub templates_bundle: PathBuf,
    pub templates_version: Option<String>,
    pub validator_image: String,
    pub reconcile_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            templates_bundle: PathBuf::from("/data/common-templates.yaml"),
            templates_version: None,
            validator_image: DEFAULT_VALIDATOR_IMAGE.to_string(),
            reconcile_timeout: Duration::from_secs(120),
        }
    }
}

pub const DEFAULT_VALIDATOR_IMAGE: &str = "quay.io/kubevirt/kubevirt-template-validator:latest";

// ── Small pure utilities ──────────────────────────────────────────────────────

/// SHA-256 hash of a string, returned as hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `namespace/name`, the form used by the owner annotation.
pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

//! Generate the SSP CRD YAML from the Rust types.
//!
//! Usage:
//!   cargo run --bin crdgen                       # stdout
//!   cargo run --bin crdgen -- --out-dir ./crds   # one file per CRD

use kube::CustomResourceExt;
use ssp_operator::crd::ssp::Ssp;
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let out_dir: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out-dir")
        .nth(1)
        .map(PathBuf::from);

    let crds = vec![("ssp-crd.yaml", serde_yaml::to_string(&Ssp::crd())?)];

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            for (name, yaml) in &crds {
                let path = dir.join(name);
                std::fs::write(&path, format!("---\n{yaml}"))?;
                eprintln!("wrote {}", path.display());
            }
        }
        None => {
            for (_name, yaml) in &crds {
                println!("---\n{yaml}");
            }
        }
    }
    Ok(())
}

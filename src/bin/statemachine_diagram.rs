//! Generate a Mermaid state diagram from the TRANSITIONS table.
//!
//! Usage:
//!   cargo run --bin statemachine_diagram                        # stdout
//!   cargo run --bin statemachine_diagram -- --out STATE_MACHINE.md

use ssp_operator::controller::state_machine::{INITIAL_PHASE, TRANSITIONS};
use std::path::PathBuf;

fn main() -> std::io::Result<()> {
    let out: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out")
        .nth(1)
        .map(PathBuf::from);

    let md = generate();

    match out {
        Some(path) => {
            std::fs::write(&path, &md)?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{md}"),
    }
    Ok(())
}

fn generate() -> String {
    let mut out = String::new();
    out.push_str("# SSP Phase State Machine\n\n");
    out.push_str("Auto-generated from the `TRANSITIONS` table in `controller/state_machine.rs`.\n\n");
    out.push_str("```mermaid\nstateDiagram-v2\n");
    out.push_str(&format!("    [*] --> {INITIAL_PHASE}\n\n"));

    let mut current_from = String::new();
    for t in TRANSITIONS.iter() {
        let from = t.from.to_string();
        if from != current_from {
            if !current_from.is_empty() {
                out.push('\n');
            }
            current_from = from.clone();
        }
        out.push_str(&format!("    {from} --> {} : {}\n", t.to, t.guard_name));
    }

    out.push_str("```\n");
    out
}

//! Declarative state machine for SSP lifecycle phases.
//!
//! Transitions are a static table of `(from, to, guard)`. Guards are pure
//! functions over [`PhaseInputs`], gathered by the engine once per pass.
//! First matching guard wins; no match keeps the current phase.

use crate::crd::ssp::SspPhase;

/// What the engine observed during one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseInputs {
    /// The SSP carries a deletion timestamp.
    pub deletion_requested: bool,
    /// Every operand reported full convergence with no mutation applied.
    pub converged: bool,
}

pub struct Transition {
    pub from: SspPhase,
    pub to: SspPhase,
    pub guard: fn(&PhaseInputs) -> bool,
    pub guard_name: &'static str,
}

use SspPhase::*;

/// The complete lifecycle transition table. `Deleting` has no outgoing
/// edges, so once entered it is never left.
pub static TRANSITIONS: &[Transition] = &[
    // ── Deploying ───────────────────────────────────────────
    Transition {
        from: Deploying,
        to: Deleting,
        guard: |i| i.deletion_requested,
        guard_name: "deletion_requested",
    },
    Transition {
        from: Deploying,
        to: Deployed,
        guard: |i| i.converged,
        guard_name: "converged",
    },
    // ── Deployed ────────────────────────────────────────────
    Transition {
        from: Deployed,
        to: Deleting,
        guard: |i| i.deletion_requested,
        guard_name: "deletion_requested",
    },
    Transition {
        from: Deployed,
        to: Deploying,
        guard: |i| !i.converged,
        guard_name: "!converged",
    },
];

/// Phase of an SSP that has never been reconciled.
pub const INITIAL_PHASE: SspPhase = Deploying;

pub fn next_phase(current: Option<&SspPhase>, inputs: &PhaseInputs) -> SspPhase {
    let current = current.cloned().unwrap_or(INITIAL_PHASE);
    TRANSITIONS
        .iter()
        .find(|t| t.from == current && (t.guard)(inputs))
        .map(|t| t.to.clone())
        .unwrap_or(current)
}

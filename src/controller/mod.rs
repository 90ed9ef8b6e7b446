pub mod engine;
pub mod helpers;
pub mod operands;
pub mod ssp;
pub mod state_machine;

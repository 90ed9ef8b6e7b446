pub mod ssp;
pub mod template;

pub mod pending;
pub mod status;

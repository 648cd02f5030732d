pub mod common;
pub mod error;

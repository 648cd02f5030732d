pub mod discover;
pub mod operator_discovery;

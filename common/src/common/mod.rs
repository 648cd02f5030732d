pub mod labels;
pub mod relabel;

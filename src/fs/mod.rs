pub mod cache;
pub mod diff;
pub mod listing;
pub mod node;
pub mod tree;

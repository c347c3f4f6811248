pub mod engine;
pub mod vector;

pub use engine::*;
pub use vector::{cosine_distance, HybridWeights};

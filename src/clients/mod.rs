pub mod embeddings;
pub mod fetch;
pub mod media;

pub use embeddings::*;
pub use fetch::*;
pub use media::*;

pub mod pipeline;
pub mod quota;

pub use pipeline::*;
pub use quota::*;

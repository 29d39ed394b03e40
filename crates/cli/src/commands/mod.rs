pub mod analyze;
pub mod annotation;

pub use analyze::*;
pub use annotation::*;

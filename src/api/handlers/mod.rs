pub mod strategies;
pub mod system;

pub use strategies::*;
pub use system::*;

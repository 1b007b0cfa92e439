pub mod memory;
pub mod traits;
pub mod types;

#[cfg(test)]
mod tests;

pub use memory::*;
pub use traits::*;
pub use types::*;

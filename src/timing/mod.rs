pub mod predictor;
pub mod slots;


pub use predictor::*;
pub use slots::*;

pub mod correction_loop;
pub mod error_classifier;
pub mod error_recovery;

pub use correction_loop::*;
pub use error_classifier::*;
pub use error_recovery::*;

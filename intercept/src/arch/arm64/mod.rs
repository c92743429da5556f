pub mod relocator;
pub mod writer;

pub use relocator::Arm64Relocator;
pub use writer::{Arm64Writer, Reg};

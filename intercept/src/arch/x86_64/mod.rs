pub mod relocator;
pub mod writer;

pub use relocator::{is_endbr64, X86_64Relocator};
pub use writer::X86_64Writer;

pub mod alert;
pub mod attempt;
pub mod enums;
pub mod filters;
pub mod signal;

pub use alert::*;
pub use attempt::*;
pub use filters::*;
pub use signal::*;

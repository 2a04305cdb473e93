pub mod address;
pub mod error;
pub mod serial;
pub mod value;

pub use address::*;
pub use error::*;
pub use serial::*;
pub use value::*;

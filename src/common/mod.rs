pub mod error;
pub use error::MiniDbError;

pub mod result;
pub use result::MiniDbResult;

pub mod value;
pub use value::{DataType, Value};

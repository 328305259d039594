use super::error::MiniDbError;

pub type MiniDbResult<T> = std::result::Result<T, MiniDbError>;

pub mod renderer;
pub use renderer::{OutputMode, Renderer};

pub mod repl;
pub use repl::Repl;

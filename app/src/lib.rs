pub mod commands;
pub mod repl;

pub use commands::ReplCommand;
pub use repl::Repl;

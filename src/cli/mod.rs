pub mod env;
pub mod runtime;

pub use env::CliArgs;
pub use runtime::{init_logging, run};

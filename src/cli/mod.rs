pub mod args;
pub mod commands;
pub mod logging;

pub use logging::init_logging;

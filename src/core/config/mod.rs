pub mod data;
pub mod io;
pub mod keys;

pub use data::{path_display, Config};
pub use io::ConfigError;

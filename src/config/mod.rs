pub mod models;
pub mod parser;

pub use models::{Config, ConfigError, Route};
pub use parser::load;

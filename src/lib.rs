// mypooler - transparent MySQL connection-pooling proxy

pub mod config;
pub mod server;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use utils::error::{MypoolerError, Result};

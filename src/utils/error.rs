use thiserror::Error;

#[derive(Debug, Error)]
pub enum MypoolerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to upstream {host}:{port}: {source}")]
    Dial {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Timed out waiting for a pool connection")]
    PoolTimeout,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Shutdown deadline exceeded with {active} session(s) still live")]
    ShutdownTimeout { active: usize },
}

pub type Result<T> = std::result::Result<T, MypoolerError>;

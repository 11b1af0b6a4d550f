pub mod handler;
pub mod listener;
pub mod pool;
pub mod relay;

pub use handler::handle_session;
pub use listener::ProxyServer;
pub use pool::{Pool, PoolOptions, PoolStats, UpstreamConn};
pub use relay::{RelayEnd, RelayReport};

pub mod config;
pub mod errors;
pub mod ids;

pub use config::Config;
pub use errors::{HttpStatus, PoolError, Result, SpawnError, SpawnErrorCategory};
pub use ids::{GroupKey, GupId, ProcessId, SessionToken, SocketName};

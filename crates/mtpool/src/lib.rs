//! Per-datacenter connection pool for MTProto clients.
//!
//! Many concurrent callers submit RPCs; the pool multiplexes them over a
//! bounded set of long-lived connections to one datacenter. Connections are
//! created on demand and reaped when they die. When the pool is saturated,
//! callers park in a FIFO queue until a connection frees up.

mod conn;
mod pool;
mod ready;
mod request_map;
mod supervisor;
mod wire;

/// Boxed error crossing the connection seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use conn::{Conn, PoolConn};
pub use pool::{AcquireError, Dc, DcHealth, DcOptions, PoolError};
pub use ready::{Ready, ResetReady};
pub use supervisor::Supervisor;
pub use wire::{Decode, Encode};

mod conn;
mod quic;

pub use conn::{CloseNotifyConn, ConnStats, ContextConn, StatsConn};
pub use quic::{QuicSession, QuicStream};

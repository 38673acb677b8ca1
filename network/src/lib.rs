//! Connection/Server/Service primitives and the per-peer relay scheduler
//! (§4.7-4.9). Grounded on `cccommon/src/ccserver/{connection,server,
//! connection_manager}.{hpp,cpp}`: a Connection is a state machine over an
//! async socket with op-counted shutdown; a Server owns a listener and a
//! pool of reusable Connections; Service sizes the executor's thread pool.
//! The original's boost::asio callback chains become async fns; the
//! AutoCount/op-counting idiom survives as [`connection::AutoCount`] since
//! it is the thing that makes `Stop()` safe to call while handlers are
//! still in flight.

pub mod connection;
pub mod relay_fsm;
pub mod server;

pub use connection::{AutoCount, ConnState, Connection, Framing};
pub use relay_fsm::RelayFsm;
pub use server::{ConnectionManager, Server, SocketOptions};

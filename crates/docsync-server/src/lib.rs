//! docsync-server library: exposes internal modules so `tests/e2e.rs` can
//! drive the relay without going through the binary's CLI.

pub mod connection;
pub mod relay;
pub mod room;
pub mod server;

pub use connection::{Connection, ConnectionEvent, SocketId, SocketIdGenerator};
pub use relay::{AuthContext, Authenticate, Authorize, BoxFuture, Relay};
pub use room::Rooms;
pub use server::{run_event_loop, WebSocketServer};

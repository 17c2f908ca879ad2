#![forbid(unsafe_op_in_unsafe_fn)]

mod backoff;
mod connection;
mod constants;
mod error;
mod events;
mod mailbox;
mod pipe;
mod queue;
mod rpc;
mod serialization;
mod shared;
mod transport;

pub mod ffi;
pub mod session;

pub use backoff::Backoff;
pub use connection::ConnectionState;
pub use constants::{MAX_MESSAGE_SIZE, QUEUE_CAPACITY};
pub use error::{ErrorCode, Result, RpcError};
pub use events::{ErrorInfo, EventHandlers};
pub use mailbox::BoundedStr;
pub use serialization::{InboundMessage, Reply, RichPresence};
pub use session::{IoMode, RpcOptions, Session};
pub use shared::StatsSnapshot;
pub use transport::{ConnectionListener, Transport};

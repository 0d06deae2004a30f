//! Side effects of a resolved request: file bodies, proxy forwarding and
//! post-response callbacks.

pub mod callbacks;
pub mod file;
pub mod proxy;
pub mod transport;

pub use callbacks::{CallbackRecord, ScheduledCallback};
pub use file::{FileReply, FileResolver};
pub use transport::{HttpTransport, InboundResponse, OutboundBody, OutboundRequest, ReqwestTransport};

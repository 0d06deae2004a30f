//! Events published by a running instance.

use crate::effects::CallbackRecord;
use crate::transaction::Transaction;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The listener is bound and accepting connections
    Started { address: SocketAddr },
    Stopped,
    /// Unmatched requests will be forwarded to the proxy host
    CreatingProxy,
    TransactionComplete(Box<Transaction>),
    CallbackInvoked(CallbackRecord),
    /// A per-request failure; `code` comes from [`crate::error::EngineError::code`]
    Error { code: String, message: String },
}

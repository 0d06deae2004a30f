//! Transaction records.
//!
//! A [`Transaction`] is the immutable record of one completed exchange. It is
//! assembled from borrowed request and response parts without side effects,
//! so logging and event capture can build it independently from the same
//! exchange and get equal records.

use crate::template::RequestContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub request: TransactionRequest,
    pub response: TransactionResponse,
    pub route_id: Option<String>,
    pub route_response_id: Option<String>,
    pub proxied: bool,
    /// Ids of the callbacks scheduled by the response
    pub callbacks: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Borrowed parts of a completed exchange.
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    pub request: &'a RequestContext,
    pub status_code: u16,
    pub response_headers: &'a [(String, String)],
    pub response_body: &'a [u8],
    pub route_id: Option<&'a str>,
    pub route_response_id: Option<&'a str>,
    pub proxied: bool,
    pub callbacks: &'a [String],
    pub completed_at: DateTime<Utc>,
}

impl Transaction {
    pub fn from_exchange(exchange: Exchange<'_>) -> Self {
        let request = exchange.request;
        Self {
            request: TransactionRequest {
                method: request.method.clone(),
                path: request.path.clone(),
                query: request.raw_query.clone(),
                params: request.params.clone(),
                headers: request.headers.clone(),
                body: request.raw_body.clone(),
            },
            response: TransactionResponse {
                status_code: exchange.status_code,
                headers: exchange.response_headers.to_vec(),
                body: String::from_utf8_lossy(exchange.response_body).to_string(),
            },
            route_id: exchange.route_id.map(str::to_string),
            route_response_id: exchange.route_response_id.map(str::to_string),
            proxied: exchange.proxied,
            callbacks: exchange.callbacks.to_vec(),
            completed_at: exchange.completed_at,
        }
    }
}

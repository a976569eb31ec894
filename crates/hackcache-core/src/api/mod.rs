//! REST API access for the hackathon server.
//!
//! This module provides the `RequestGateway`, which turns a
//! (route, method, parameters) tuple into exactly one exchange over a
//! pluggable `Transport` and classifies the outcome.
//!
//! Requests are authorized with the session token held by the
//! `CredentialManager` (`Authorization: Token <token>`).

pub mod client;
pub mod error;
pub mod transport;

pub use client::{NetworkActivity, RequestGateway};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};

#![cfg_attr(docsrs, feature(doc_cfg))]
//! An authenticated client for the vantage6 server API.
//!
//! The [`Client`] wraps an [`HttpBackend`] (a [`reqwest::Client`] in production)
//! and takes care of:
//!
//! - injecting the `Authorization: Bearer <access token>` header,
//! - refreshing the access token once and re-issuing a request that failed,
//! - retrying requests that failed to connect, optionally a bounded number of
//!   times,
//! - (de)serializing the JSON bodies.
//!
//! The endpoints a node talks to are available as typed methods, see the
//! [`node`] module.

mod client;
pub mod node;
mod transport;

#[cfg(test)]
mod testutils;

pub use self::{
    client::{AuthOutcome, Client, ClientError, ClientSettings, Request},
    transport::{reqwest_backend, HttpBackend, HttpRequest, HttpResponse, Method, TransportError},
};

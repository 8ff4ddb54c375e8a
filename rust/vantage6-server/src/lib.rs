#![cfg_attr(docsrs, feature(doc_cfg))]
//! Server side components of vantage6.
//!
//! Only the [`permission`] engine lives here: the REST resources, their
//! schemas and the database models are provided by the surrounding server
//! application, which calls into the engine on every request.

pub mod permission;

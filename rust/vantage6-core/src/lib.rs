#![cfg_attr(docsrs, feature(doc_cfg))]
//! Building blocks shared by the vantage6 node, its HTTP client and the
//! permission engine of the server.
//!
//! - [`common`]: the records exchanged with the central server (tasks, results,
//!   organizations, pagination envelopes).
//! - [`identity`]: the principals that can authenticate against the server and
//!   the claims carried by their access tokens.
//! - [`crypto`]: the capability used to encrypt task inputs and results
//!   end-to-end between organizations.

pub mod common;
pub mod crypto;
pub mod identity;

pub use self::{
    common::{
        Collaboration,
        Links,
        NodeRecord,
        Organization,
        Page,
        ResultRecord,
        ResultUpdate,
        TaskRecord,
        TaskRef,
        TaskResult,
    },
    identity::{ClaimedIdentity, ContainerIdentity, Principal, PrincipalKind, TokenClaims, WhoAmI},
};

/// The label of the database a task runs against when it does not name one,
/// or when the label it names is not configured at the node.
pub const DEFAULT_DATABASE: &str = "default";

//! Rules, roles and the evaluation of a principal's permissions.
//!
//! Every resource of the server API declares the rules it needs through
//! [`ResourcePermissions`]. The declarations are collected once at startup in
//! a [`RuleRegistry`], which is then frozen into a [`PermissionManager`].
//! For each authenticated principal the manager derives [`Permissions`]: one
//! [`RuleCollection`] per resource, holding a flag for each registered
//! `(operation, scope)` pair.
//!
//! Scopes form a total order, `Own < Organization < Collaboration < Global`,
//! so a rule granted at some scope also satisfies every lower scope.

mod collection;
mod registry;
pub mod resources;

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    collection::{Membership, MissingRule, Permissions, RuleCollection},
    registry::{Grants, PermissionManager, ResourcePermissions, RuleRegistry},
};

/// The breadth of a rule.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[display(fmt = "own")]
    Own,
    #[display(fmt = "organization")]
    Organization,
    #[display(fmt = "collaboration")]
    Collaboration,
    #[display(fmt = "global")]
    Global,
}

impl Scope {
    /// All the scopes, in increasing order.
    pub const ALL: [Scope; 4] = [
        Scope::Own,
        Scope::Organization,
        Scope::Collaboration,
        Scope::Global,
    ];

    /// The scopes that are at least as broad as `self`.
    pub fn at_least(self) -> impl Iterator<Item = Scope> {
        Self::ALL.into_iter().filter(move |scope| *scope >= self)
    }
}

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[display(fmt = "view")]
    View,
    #[display(fmt = "edit")]
    Edit,
    #[display(fmt = "create")]
    Create,
    #[display(fmt = "delete")]
    Delete,
    #[display(fmt = "send")]
    Send,
    #[display(fmt = "receive")]
    Receive,
}

/// A role whose rules are assigned by the server itself.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixedRole {
    /// Holds every registered rule.
    #[display(fmt = "Root")]
    Root,
    #[display(fmt = "node")]
    #[serde(rename = "node")]
    Node,
    #[display(fmt = "container")]
    #[serde(rename = "container")]
    Container,
}

/// A named `(resource, scope, operation)` permission.
///
/// The triple is unique within a [`RuleRegistry`]. Rules of unscoped
/// resources are stored with [`Scope::Global`].
#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[display(fmt = "({}, {}, {})", name, scope, operation)]
pub struct Rule {
    pub id: u64,
    pub name: String,
    pub scope: Scope,
    pub operation: Operation,
    #[serde(default)]
    pub description: Option<String>,
}

impl Rule {
    pub fn key(&self) -> RuleKey {
        RuleKey {
            name: self.name.clone(),
            scope: self.scope,
            operation: self.operation,
        }
    }
}

/// The identifying triple of a [`Rule`].
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "({}, {}, {})", name, scope, operation)]
pub struct RuleKey {
    pub name: String,
    pub scope: Scope,
    pub operation: Operation,
}

impl RuleKey {
    pub fn new<S: Into<String>>(name: S, scope: Scope, operation: Operation) -> Self {
        Self {
            name: name.into(),
            scope,
            operation,
        }
    }
}

/// Errors raised while rules are registered.
#[derive(Debug, DisplayDoc, Error)]
pub enum PermissionError {
    /// Resource {0} is unscoped, it can't have a rule with scope {1}.
    ScopedRuleOnUnscopedResource(String, Scope),
    /// Resource {0} is scoped, it can't have an unscoped rule.
    UnscopedRuleOnScopedResource(String),
}

//! Principals and the claims of their access tokens.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The kind of entity that authenticated against the server.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    #[display(fmt = "user")]
    User,
    #[display(fmt = "node")]
    Node,
    #[display(fmt = "container")]
    Container,
}

/// The identity an algorithm container receives with its token.
///
/// It is derived once from the container token and never refreshed, since
/// containers cannot refresh their tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub node_id: u64,
    pub organization_id: u64,
    pub collaboration_id: u64,
    pub task_id: u64,
    pub image: String,
}

/// An authenticated entity, together with the organization it acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User {
        id: u64,
        organization_id: u64,
    },
    Node {
        id: u64,
        organization_id: u64,
        collaboration_id: u64,
    },
    Container(ContainerIdentity),
}

impl Principal {
    pub fn kind(&self) -> PrincipalKind {
        match self {
            Principal::User { .. } => PrincipalKind::User,
            Principal::Node { .. } => PrincipalKind::Node,
            Principal::Container(_) => PrincipalKind::Container,
        }
    }

    /// The organization on whose behalf the principal acts.
    pub fn organization_id(&self) -> u64 {
        match self {
            Principal::User {
                organization_id, ..
            }
            | Principal::Node {
                organization_id, ..
            } => *organization_id,
            Principal::Container(identity) => identity.organization_id,
        }
    }
}

/// Who the (authenticated) process is. Set once after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmI {
    #[serde(rename = "type")]
    pub kind: PrincipalKind,
    pub id: u64,
    pub name: String,
    pub organization_id: u64,
    pub organization_name: String,
}

/// Errors raised when the payload of an access token can't be interpreted.
#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("the token is not a JWT")]
    Malformed,
    #[error("the token payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("the token payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("the token identity does not match its type {0}")]
    Identity(PrincipalKind),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserClaims {
    #[serde(rename = "type", default)]
    pub kind: Option<PrincipalKind>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// The identity claims of an access token. The signature is not verified:
/// the server does that on every request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenClaims {
    #[serde(alias = "identity")]
    pub sub: Value,
    #[serde(default)]
    pub user_claims: UserClaims,
}

/// The identity a token was issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimedIdentity {
    User(u64),
    Node(u64),
    Container(ContainerIdentity),
}

impl ClaimedIdentity {
    pub fn kind(&self) -> PrincipalKind {
        match self {
            ClaimedIdentity::User(_) => PrincipalKind::User,
            ClaimedIdentity::Node(_) => PrincipalKind::Node,
            ClaimedIdentity::Container(_) => PrincipalKind::Container,
        }
    }
}

impl TokenClaims {
    /// Decodes the payload segment of a JWT.
    pub fn from_token(token: &str) -> Result<Self, ClaimsError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) => payload,
            _ => return Err(ClaimsError::Malformed),
        };
        let bytes = base64::decode_config(payload.trim_end_matches('='), base64::URL_SAFE_NO_PAD)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Interprets the claims. Tokens without a `type` claim belong to users.
    pub fn identity(&self) -> Result<ClaimedIdentity, ClaimsError> {
        let kind = self.user_claims.kind.unwrap_or(PrincipalKind::User);
        match kind {
            PrincipalKind::User => self
                .sub
                .as_u64()
                .map(ClaimedIdentity::User)
                .ok_or(ClaimsError::Identity(kind)),
            PrincipalKind::Node => self
                .sub
                .as_u64()
                .map(ClaimedIdentity::Node)
                .ok_or(ClaimsError::Identity(kind)),
            PrincipalKind::Container => serde_json::from_value(self.sub.clone())
                .map(ClaimedIdentity::Container)
                .map_err(|_| ClaimsError::Identity(kind)),
        }
    }
}

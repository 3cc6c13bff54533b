//! Shared types: errors and actor identity

mod error;

pub use error::{Result, TraceError};

use serde::{Deserialize, Serialize};

/// Opaque actor identifier supplied by the authentication collaborator.
/// The core trusts this value and performs no credential checks.
pub type ActorId = String;

/// Actor category, supplied alongside the actor id.
///
/// Recorded on annotations for trust tiering; authorization decisions beyond
/// record ownership are the front-door collaborator's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Farmer,
    Retailer,
    Admin,
    Consumer,
}

impl ActorRole {
    /// Parse a role header value; unknown values default to the least
    /// privileged category.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "farmer" => Self::Farmer,
            "retailer" => Self::Retailer,
            "admin" => Self::Admin,
            _ => Self::Consumer,
        }
    }
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Farmer => "farmer",
            Self::Retailer => "retailer",
            Self::Admin => "admin",
            Self::Consumer => "consumer",
        };
        write!(f, "{}", s)
    }
}

/// Acting identity attached to every core call
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: ActorId,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(ActorRole::parse("farmer"), ActorRole::Farmer);
        assert_eq!(ActorRole::parse("RETAILER"), ActorRole::Retailer);
        assert_eq!(ActorRole::parse("nonsense"), ActorRole::Consumer);
    }
}

//! SPIFFE workload identities.
//!
//! Every peer presents an mTLS certificate whose SAN carries a URI of the
//! form `spiffe://<trust_domain>/<role>/<id>`. The `(role, id)` pair is the
//! principal used by registries and policy lookups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The role segment of a SPIFFE ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Connector,
    Tunneler,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Connector => "connector",
            Role::Tunneler => "tunneler",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Role::Controller),
            "connector" => Ok(Role::Connector),
            "tunneler" => Ok(Role::Tunneler),
            other => Err(SpiffeIdError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpiffeIdError {
    #[error("not a spiffe URI: {0}")]
    NotSpiffe(String),
    #[error("malformed spiffe path: {0}")]
    MalformedPath(String),
    #[error("unknown spiffe role: {0}")]
    UnknownRole(String),
}

/// A parsed `spiffe://<trust_domain>/<role>/<id>` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    pub trust_domain: String,
    pub role: Role,
    pub id: String,
}

impl SpiffeId {
    pub fn new(trust_domain: impl Into<String>, role: Role, id: impl Into<String>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
            role,
            id: id.into(),
        }
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spiffe://{}/{}/{}", self.trust_domain, self.role, self.id)
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("spiffe://")
            .ok_or_else(|| SpiffeIdError::NotSpiffe(s.to_string()))?;
        let mut parts = rest.splitn(3, '/');
        let trust_domain = parts.next().unwrap_or_default();
        let role = parts.next().unwrap_or_default();
        let id = parts.next().unwrap_or_default();
        if trust_domain.is_empty() || role.is_empty() || id.is_empty() {
            return Err(SpiffeIdError::MalformedPath(s.to_string()));
        }
        Ok(SpiffeId {
            trust_domain: trust_domain.to_string(),
            role: role.parse()?,
            id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let id: SpiffeId = "spiffe://mycorp.internal/connector/con-1".parse().unwrap();
        assert_eq!(id.trust_domain, "mycorp.internal");
        assert_eq!(id.role, Role::Connector);
        assert_eq!(id.id, "con-1");
        assert_eq!(id.to_string(), "spiffe://mycorp.internal/connector/con-1");
    }

    #[test]
    fn id_may_contain_slashes() {
        let id: SpiffeId = "spiffe://td/tunneler/team/a/laptop".parse().unwrap();
        assert_eq!(id.id, "team/a/laptop");
    }

    #[test]
    fn rejects_non_spiffe() {
        assert!("https://mycorp.internal/connector/x".parse::<SpiffeId>().is_err());
    }

    #[test]
    fn rejects_unknown_role() {
        assert!("spiffe://td/admin/x".parse::<SpiffeId>().is_err());
    }

    #[test]
    fn rejects_missing_segments() {
        assert!("spiffe://td/connector".parse::<SpiffeId>().is_err());
        assert!("spiffe://td".parse::<SpiffeId>().is_err());
    }
}

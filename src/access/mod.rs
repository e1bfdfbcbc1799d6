use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of whoever sent a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

impl Sender {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

pub trait AccessPolicy: Send + Sync + 'static {
    fn is_allowed(&self, sender: &Sender) -> bool;
}

pub type SharedAccessPolicy = Arc<dyn AccessPolicy>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdSet {
    Everyone,
    Nobody,
    Only(HashSet<i64>),
}

impl IdSet {
    fn parse(raw: &str, field: &'static str) -> Result<Self, AccessError> {
        let trimmed = raw.trim();
        match trimmed {
            "*" => return Ok(Self::Everyone),
            "" | "-" => return Ok(Self::Nobody),
            _ => {}
        }
        trimmed
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i64>().map_err(|_| AccessError::InvalidId {
                    field,
                    value: part.to_string(),
                })
            })
            .collect::<Result<HashSet<_>, _>>()
            .map(Self::Only)
    }

    fn contains(&self, id: i64) -> bool {
        match self {
            Self::Everyone => true,
            Self::Nobody => false,
            Self::Only(ids) => ids.contains(&id),
        }
    }
}

/// Comma-separated id lists. `*` admits everyone; `-` (or empty) nobody.
/// Admins are always allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    allowed: IdSet,
    admins: IdSet,
}

impl AllowList {
    pub fn parse(allowed: &str, admins: &str) -> Result<Self, AccessError> {
        Ok(Self {
            allowed: IdSet::parse(allowed, "allowed")?,
            admins: IdSet::parse(admins, "admins")?,
        })
    }
}

impl AccessPolicy for AllowList {
    fn is_allowed(&self, sender: &Sender) -> bool {
        self.allowed.contains(sender.id) || self.admins.contains(sender.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("invalid {field} user id '{value}'")]
    InvalidId { field: &'static str, value: String },
}

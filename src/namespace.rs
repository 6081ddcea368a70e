//! Collection namespace.

use std::fmt;

use crate::{CloneError, Result};

/// collection namespace, `db_name.coll_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// database name.
    db_name: String,
    /// collection name.
    coll_name: String,
}

impl Namespace {
    /// construct a namespace from `db_name` and `coll_name`.
    pub fn new(db_name: impl Into<String>, coll_name: impl Into<String>) -> Self {
        Namespace {
            db_name: db_name.into(),
            coll_name: coll_name.into(),
        }
    }

    /// parse a full `db.coll` namespace string.  Collection name may contain dots.
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            _ => Err(CloneError::InvalidNamespace(ns.to_string())),
        }
    }

    /// database name.
    pub fn db(&self) -> &str {
        &self.db_name
    }

    /// collection name.
    pub fn coll(&self) -> &str {
        &self.coll_name
    }

    /// Tenant databases are named `<tenant_id>_<db>`.
    pub fn belongs_to_tenant(&self, tenant_id: &str) -> bool {
        self.db_name.len() > tenant_id.len() + 1
            && self.db_name.starts_with(tenant_id)
            && self.db_name.as_bytes()[tenant_id.len()] == b'_'
    }

    /// `true` for the internal `system.*` collections.
    pub fn is_system(&self) -> bool {
        self.coll_name.starts_with("system.")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db_name, self.coll_name)
    }
}

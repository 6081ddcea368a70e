//! tenant cloner basic configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [src]
//! # donor node url, the cloner reads from this single node.
//! url = "mongodb://localhost:27017/?directConnection=true"
//!
//! [dst]
//! url = "mongodb://localhost:27018"
//!
//! [migration]
//! tenant_id = "tenantA"
//! dbs = ["tenantA_db1", "tenantA_db2"]
//! resuming = false
//! batch_size = 10000
//! ```
use serde::Deserialize;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::blocking::cloner::ClonerOptions;
use crate::{Result, DEFAULT_BATCH_SIZE};

/// Global tenant cloner configuration.
#[derive(Deserialize, Debug)]
pub struct ClonerConfig {
    src: Src,
    dst: Dst,
    migration: MigrationConf,
}

impl ClonerConfig {
    /// read configuration from toml file in `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<ClonerConfig> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// get source mongodb url.
    pub fn get_src_url(&self) -> &str {
        &self.src.url
    }

    /// get destination mongodb url.
    pub fn get_dst_url(&self) -> &str {
        &self.dst.url
    }

    /// get migration detail configuration.
    pub fn get_migration(&self) -> &MigrationConf {
        &self.migration
    }
}

/// Source database confuration.
#[derive(Deserialize, Debug)]
pub struct Src {
    /// Donor node url, it needs to be a replica set member, begins with 'mongodb://'
    url: String,
}

/// Target database configuration.
#[derive(Deserialize, Debug)]
pub struct Dst {
    /// Target database url.  Which begins with 'mongodb://'
    url: String,
}

/// Detail migration config, it indicates which tenant, and which databases to clone.
#[derive(Deserialize, Debug)]
pub struct MigrationConf {
    /// tenant to migrate, every database in `dbs` must be prefixed by `<tenant_id>_`.
    tenant_id: String,
    /// tenant databases to clone.
    dbs: Vec<String>,
    /// is this a retry of a previous migration attempt?
    #[serde(default)]
    resuming: bool,
    /// how many documents are requested in one network batch.
    #[serde(default = "default_batch_size")]
    batch_size: u32,
    /// migration id, a random one is generated when missing.
    #[serde(default)]
    migration_id: Option<Uuid>,
}

impl MigrationConf {
    /// get tenant id.
    pub fn get_tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// get databases to clone.
    pub fn get_dbs(&self) -> &[String] {
        &self.dbs
    }

    /// is this migration resuming?
    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    /// get migration id.
    pub fn get_migration_id(&self) -> Option<Uuid> {
        self.migration_id
    }

    /// build per collection cloner options.
    pub fn cloner_options(&self) -> ClonerOptions {
        ClonerOptions {
            batch_size: self.batch_size,
        }
    }
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

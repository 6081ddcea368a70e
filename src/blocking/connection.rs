use crate::error::{CloneError, Result};
use mongodb::options::ClientOptions;
use mongodb::sync::{Client, Database};

#[derive(Clone)]
/// A simple abstraction for tenant cloner connection.
///
/// The source client is always a direct connection: cursors opened by the cloner must be
/// continued (`getMore`) on the same donor node.
pub struct Connection {
    inner: ConnectionInner,
}

impl Connection {
    /// create a new connection from donor `src_uri` and recipient `dst_uri`.
    pub fn new(src_uri: &str, dst_uri: &str) -> Result<Connection> {
        let mut source_options = ClientOptions::parse(src_uri)?;
        source_options.direct_connection = Some(true);
        let source_conn = Client::with_options(source_options)?;
        let target_conn = Client::with_uri_str(dst_uri)?;
        Ok(Connection {
            inner: ConnectionInner {
                source_conn,
                target_conn,
                src_uri: src_uri.to_string(),
                dst_uri: dst_uri.to_string(),
            },
        })
    }

    /// Check if we have enough permissions to clone database `db_name`.
    pub fn check_permissions(&self, db_name: &str) -> Result<()> {
        self.inner.check_permissions(db_name)
    }

    /// get donor database.
    pub fn source_db(&self, db_name: &str) -> Database {
        self.inner.source_conn.database(db_name)
    }

    /// get donor mongodb client.
    pub fn source_client(&self) -> Client {
        self.inner.source_conn.clone()
    }

    /// get recipient mongodb client.
    pub fn target_client(&self) -> Client {
        self.inner.target_conn.clone()
    }

    /// get donor uri, it's used as the source endpoint in logs.
    pub fn source_uri(&self) -> &str {
        &self.inner.src_uri
    }
}

#[derive(Clone)]
struct ConnectionInner {
    source_conn: Client,
    target_conn: Client,
    src_uri: String,
    dst_uri: String,
}

impl ConnectionInner {
    pub fn check_permissions(&self, db_name: &str) -> Result<()> {
        let source_db = self.source_conn.database(db_name);
        if let Err(e) = source_db.list_collection_names(None) {
            return Err(CloneError::PermissionError {
                uri: self.src_uri.clone(),
                db: db_name.to_string(),
                detail: e,
            });
        }

        let target_db = self.target_conn.database(db_name);
        if let Err(e) = target_db.list_collection_names(None) {
            return Err(CloneError::PermissionError {
                uri: self.dst_uri.clone(),
                db: db_name.to_string(),
                detail: e,
            });
        }

        Ok(())
    }
}

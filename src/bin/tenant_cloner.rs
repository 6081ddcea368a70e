use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tenant_cloner::blocking::cloner::mongo_helper;
use tenant_cloner::{
    ClonerConfig, ClonerContext, CloneError, CloneOutcome, CollectionCloner, Connection,
    MigrationSharedData, MongoLocalStorage, MongoSourceReader, OrderedScheduler,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// configuration file path.
    #[clap(short, long, default_value = "config.toml")]
    conf: String,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match opts.log_path {
        Some(path) => {
            let path = Path::new(&path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("invalid log path {}", path.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf = ClonerConfig::from_path(&opts.conf)?;
    if let Err(e) = clone_tenant(&conf) {
        error!(?e, "Clone tenant failed.");
        std::process::exit(1);
    }
    Ok(())
}

fn clone_tenant(conf: &ClonerConfig) -> Result<(), CloneError> {
    let migration = conf.get_migration();
    let conn = Connection::new(conf.get_src_url(), conf.get_dst_url())?;
    for db in migration.get_dbs() {
        conn.check_permissions(db)?;
    }

    let shared_data = match migration.get_migration_id() {
        Some(id) => MigrationSharedData::with_migration_id(id, migration.is_resuming()),
        None => MigrationSharedData::new(migration.is_resuming()),
    };
    let ctx = ClonerContext {
        shared_data: Arc::new(shared_data),
        reader: Arc::new(MongoSourceReader::new(conn.source_client())),
        storage: Arc::new(MongoLocalStorage::new(conn.target_client())),
        scheduler: Arc::new(OrderedScheduler::new()?),
    };
    info!(
        tenant_id = migration.get_tenant_id(),
        migration_id = %ctx.shared_data.migration_id(),
        resuming = migration.is_resuming(),
        "Start cloning tenant."
    );

    for db in migration.get_dbs() {
        let collections = mongo_helper::list_source_collections(&conn.source_db(db))?;
        info!(db = db.as_str(), count = collections.len(), "Found collections to clone.");
        for (ns, options) in collections {
            let mut cloner = CollectionCloner::new(
                ns,
                options,
                migration.get_tenant_id(),
                conn.source_uri(),
                ctx.clone(),
                migration.cloner_options(),
            )?;
            match cloner.run()? {
                CloneOutcome::Success => {
                    info!(stats = %cloner.stats(), "Collection cloned.")
                }
                CloneOutcome::DroppedCleanly => {
                    info!(namespace = %cloner.source_nss(), "Collection dropped on donor, skip it.")
                }
            }
        }
    }
    info!(tenant_id = migration.get_tenant_id(), "Clone tenant complete.");
    Ok(())
}

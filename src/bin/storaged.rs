#![warn(clippy::all)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use storaged::cursor::{CursorStore as _, FileCursorStore};
use storaged::protocol::message::DiskUsage;
use storaged::tracker::{self, SessionContext, Shared};
use storaged::transport::TcpTransport;
use storaged::workers::{LoggingWorkers, ThreadScheduler};
use storaged::{Config, Error};

fn main() -> Result<(), Error> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("/etc/storaged.yaml"),
        )
        .get_matches();
    let config = Config::load(args.get_one::<String>("config").expect("has default"))?;

    let loglevel = config.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("storaged");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    if config.trackers.is_empty() {
        return Err(Error::InvalidData("no trackers configured".into()));
    }

    let cursor_store = FileCursorStore::new(Path::new(&config.data_dir).join("sync_cursor"));
    let cursor = cursor_store.load()?;
    info!(
        "starting storage node {} in group {}, {} trackers, sync source {:?}",
        config.id,
        config.group_name,
        config.trackers.len(),
        cursor.source_id
    );

    let now = tracker::session::unix_now();
    let transport = TcpTransport::new(
        Duration::from_secs(config.connect_timeout),
        Duration::from_secs(config.network_timeout),
    );
    let shared = Arc::new(Shared::new(config.trackers.len(), cursor));
    let ctx = Arc::new(SessionContext {
        shared,
        transport: Arc::new(transport),
        workers: Arc::new(LoggingWorkers),
        allocator: Arc::new(LoggingWorkers),
        scheduler: Arc::new(ThreadScheduler::new()),
        cursor_store: Arc::new(cursor_store),
        join_time: now,
        start_time: now,
        config,
    });

    // One disk usage entry per store path; the storage engine updates them.
    ctx.shared.lock().disk_usage =
        vec![DiskUsage::default(); ctx.config.store_path_count as usize];

    for handle in tracker::spawn_sessions(ctx) {
        handle.join().map_err(|_| Error::Abort)?;
    }
    Ok(())
}

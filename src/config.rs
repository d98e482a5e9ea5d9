//! Daemon configuration, loaded from a file with environment overrides.

use crate::error::Result;

use serde_derive::Deserialize;

/// Storage daemon configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Stable cluster identifier of this node.
    pub id: String,
    /// The replication group this node belongs to.
    pub group_name: String,
    /// Advertised address and service port.
    pub ip: String,
    pub port: u32,
    pub http_port: u32,
    /// Tracker addresses as host:port, one session each.
    pub trackers: Vec<String>,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub upload_priority: i32,
    /// Whether peers are addressed by storage id (trackers re-resolve ids to
    /// current addresses) rather than by literal address.
    pub use_storage_id: bool,
    /// Seconds between heartbeats; also the reconnect backoff.
    pub heartbeat_interval: u64,
    /// Seconds between disk usage reports.
    pub stat_report_interval: u64,
    pub connect_timeout: u64,
    pub network_timeout: u64,
    pub data_dir: String,
    pub log_level: String,
    /// Interval in seconds for advance trunk-file pre-creation while holding
    /// the allocator role; 0 disables the job.
    pub trunk_precreate_interval: u64,
    /// Interval in seconds for trunk binlog compression; 0 disables the job.
    pub trunk_compress_interval: u64,
}

impl Config {
    /// Loads the configuration from the given file, applying defaults and
    /// STORAGED_-prefixed environment variable overrides.
    pub fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", "storage01")?
            .set_default("group_name", "group1")?
            .set_default("ip", "127.0.0.1")?
            .set_default("port", 23000)?
            .set_default("http_port", 0)?
            .set_default("trackers", Vec::<String>::new())?
            .set_default("store_path_count", 1)?
            .set_default("subdir_count_per_path", 256)?
            .set_default("upload_priority", 10)?
            .set_default("use_storage_id", false)?
            .set_default("heartbeat_interval", 30)?
            .set_default("stat_report_interval", 300)?
            .set_default("connect_timeout", 5)?
            .set_default("network_timeout", 30)?
            .set_default("data_dir", "/var/lib/storaged")?
            .set_default("log_level", "info")?
            .set_default("trunk_precreate_interval", 0)?
            .set_default("trunk_compress_interval", 0)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("STORAGED"))
            .build()?
            .try_deserialize()?)
    }
}

#[cfg(test)]
impl Config {
    /// A minimal config for unit tests.
    pub(crate) fn for_tests(trackers: Vec<String>) -> Self {
        Self {
            id: "s1".into(),
            group_name: "group1".into(),
            ip: "10.0.0.1".into(),
            port: 23000,
            http_port: 0,
            trackers,
            store_path_count: 1,
            subdir_count_per_path: 256,
            upload_priority: 10,
            use_storage_id: false,
            heartbeat_interval: 1,
            stat_report_interval: 5,
            connect_timeout: 1,
            network_timeout: 1,
            data_dir: "/tmp".into(),
            log_level: "debug".into(),
            trunk_precreate_interval: 60,
            trunk_compress_interval: 120,
        }
    }
}

//! Host configuration.

use std::time::Duration;

/// Default ports for the four services. Each transport endpoint also
/// reserves its port plus [`Config::reply_port_offset`] for the sync pair.
pub const DEFAULT_STATE_PORT: u16 = 8003;
pub const DEFAULT_FUNCTION_CALL_PORT: u16 = 8004;
pub const DEFAULT_SNAPSHOT_PORT: u16 = 8005;
pub const DEFAULT_MPI_PORT: u16 = 8800;

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address other hosts use to reach this one. Doubles as the host's
    /// identity in the membership set.
    pub this_host: String,

    /// Local bind address for all servers.
    pub bind_host: String,

    /// Base port of the state service.
    pub state_port: u16,

    /// Base port of the function-call service.
    pub function_call_port: u16,

    /// Base port of the snapshot service.
    pub snapshot_port: u16,

    /// Base port of the MPI message service.
    pub mpi_port: u16,

    /// Offset added to a base port to reach its sync (request/reply) pair.
    pub reply_port_offset: u16,

    /// Per-client timeout on synchronous requests.
    pub client_timeout: Duration,

    /// Bound on concurrently executing server handlers.
    pub server_workers: usize,

    /// TTL applied to `result:<id>` queue entries.
    pub result_ttl_secs: u64,

    /// TTL applied to `status:<id>` and `chained_<id>` entries. Longer than
    /// the result TTL so execution graphs outlive their results.
    pub status_ttl_secs: u64,

    /// Override for the usable core count; defaults to the machine's.
    pub cores_override: Option<usize>,
}

impl Config {
    /// Load configuration from `FILAMENT_*` environment variables, falling
    /// back to the defaults above.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            this_host: env_or("FILAMENT_HOST", "127.0.0.1"),
            bind_host: env_or("FILAMENT_BIND_HOST", "0.0.0.0"),
            state_port: env_parsed("FILAMENT_STATE_PORT", DEFAULT_STATE_PORT),
            function_call_port: env_parsed(
                "FILAMENT_FUNCTION_CALL_PORT",
                DEFAULT_FUNCTION_CALL_PORT,
            ),
            snapshot_port: env_parsed("FILAMENT_SNAPSHOT_PORT", DEFAULT_SNAPSHOT_PORT),
            mpi_port: env_parsed("FILAMENT_MPI_PORT", DEFAULT_MPI_PORT),
            reply_port_offset: env_parsed("FILAMENT_REPLY_PORT_OFFSET", 100),
            client_timeout: Duration::from_millis(env_parsed("FILAMENT_CLIENT_TIMEOUT_MS", 8000)),
            server_workers: env_parsed("FILAMENT_SERVER_WORKERS", num_cpus::get()),
            result_ttl_secs: env_parsed("FILAMENT_RESULT_TTL_SECS", 30),
            status_ttl_secs: env_parsed("FILAMENT_STATUS_TTL_SECS", 300),
            cores_override: std::env::var("FILAMENT_CORES")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Number of cores the scheduler may bind executors to.
    pub fn usable_cores(&self) -> usize {
        self.cores_override.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Sync-pair port for a given base port.
    pub fn reply_port(&self, base: u16) -> u16 {
        base + self.reply_port_offset
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            this_host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            state_port: DEFAULT_STATE_PORT,
            function_call_port: DEFAULT_FUNCTION_CALL_PORT,
            snapshot_port: DEFAULT_SNAPSHOT_PORT,
            mpi_port: DEFAULT_MPI_PORT,
            reply_port_offset: 100,
            client_timeout: Duration::from_millis(8000),
            server_workers: num_cpus::get(),
            result_ttl_secs: 30,
            status_ttl_secs: 300,
            cores_override: None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

//! Command Line Interface (CLI) arguments.

use byte_unit::Byte;
use clap::Parser;
use url::Url;

/// cubeops command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "CUBEOPS_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "CUBEOPS_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "CUBEOPS_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/cubeops/certs/cert.pem",
        env = "CUBEOPS_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/cubeops/certs/key.pem",
        env = "CUBEOPS_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "CUBEOPS_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Default number of workers per operator invocation. Defaults to the number of CPUs.
    #[arg(long, env = "CUBEOPS_WORKERS")]
    pub workers: Option<usize>,
    /// Number of in-memory storage servers registered at start-up
    #[arg(long, default_value_t = 2, env = "CUBEOPS_DBMS_INSTANCES")]
    pub dbms_instances: u16,
    /// Base URL of datacube PIDs
    #[arg(
        long,
        default_value = "http://localhost/cubeops",
        env = "CUBEOPS_PID_BASE_URL"
    )]
    pub pid_base_url: Url,
    /// Maximum number of concurrently open storage connections.
    #[arg(long, env = "CUBEOPS_CONNECTION_LIMIT")]
    pub connection_limit: Option<usize>,
    /// Memory limit for fragment transforms, e.g. `512MiB`. Unlimited when unset.
    #[arg(long, env = "CUBEOPS_MEMORY_LIMIT", value_parser = parse_byte_size)]
    pub memory_limit: Option<usize>,
    /// Maximum number of concurrent local helpers. Defaults to the number of CPUs - 1.
    #[arg(long, env = "CUBEOPS_HELPER_LIMIT")]
    pub helper_limit: Option<usize>,
}

impl CommandLineArgs {
    /// Worker-group size used when a request does not name one.
    pub fn default_workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Parse a human-readable byte size.
fn parse_byte_size(size: &str) -> Result<usize, String> {
    let bytes = Byte::parse_str(size, /* ignore case */ true)
        .map_err(|err| err.to_string())?
        .as_u64();
    usize::try_from(bytes).map_err(|err| err.to_string())
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "relay streaming executor", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub backend: BackendCommand,
}

/// General options shared by every backend. Make sure the kernel is running
/// before starting an executor, unless `--ignore-kernel` is set.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Access name to register with the kernel; repeat for multiple names.
    #[arg(long = "access-code", required = true)]
    pub access_codes: Vec<String>,

    /// Base URL of the kernel's executor management API.
    #[arg(long, default_value = "http://127.0.0.1:9000/")]
    pub kernel_url: String,

    /// Skip kernel registration entirely.
    #[arg(long)]
    pub ignore_kernel: bool,

    /// Register the executor endpoint with the https scheme.
    #[arg(long)]
    pub https: bool,

    /// Hostname or IP address stored in the kernel; it must be reachable
    /// from the kernel's side of the network.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to serve on; 0 picks an unused port.
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Path the chat endpoint is served under.
    #[arg(long, default_value = "/chat")]
    pub executor_path: String,

    /// Number of allowed concurrent requests.
    #[arg(long, default_value_t = 1)]
    pub concurrent_req_limit: usize,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log: String,
}

impl Settings {
    pub fn in_debug(&self) -> bool {
        self.log.eq_ignore_ascii_case("debug") || self.log.eq_ignore_ascii_case("trace")
    }
}

#[derive(Debug, Subcommand)]
pub enum BackendCommand {
    /// Serve the agent flow interpreter.
    Agent {
        /// Default upstream base URL for chained bot calls.
        #[arg(long, default_value = "http://127.0.0.1/")]
        api_base_url: String,

        /// Authentication token for chained bot calls.
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Serve the tool bridge.
    Mcp {
        /// Command spawning the tool provider over a local pipe.
        #[arg(long, default_value = "")]
        server_cmd: String,

        /// Arguments of the tool provider command.
        #[arg(long, default_value = "")]
        server_args: String,

        /// Remote streaming endpoint of the tool provider; takes precedence
        /// over the local command when set.
        #[arg(long)]
        server_url: Option<String>,
    },
}

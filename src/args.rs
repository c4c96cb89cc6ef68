use clap::Parser;

#[derive(Parser)]
#[command(name = "svcrt")]
#[command(version)]
#[command(about = "Run a service under a native backend or attach to a running one", long_about = None)]
pub(crate) struct Cli {
    /// Backend to run under (default: standard). Can also be set via SVCRT_BACKEND env var.
    #[arg(long)]
    pub backend: Option<String>,

    /// Attach to the running instance instead of starting the service
    #[arg(long)]
    pub terminal: bool,

    /// Passed to the backend, or the terminal command (e.g. `stop`, `echo hi`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

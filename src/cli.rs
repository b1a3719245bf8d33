use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "rhammer - complete lots of DNS queries asynchronously",
    long_about = "rhammer saturates a pool of recursive resolvers with a list of DNS \
questions under a per-resolver concurrency cap, retries on timeout, prints every \
matching resource record, and stops once the work is drained or no resolver is \
responding anymore.\n\n\
Examples:\n  \
rhammer query -r resolvers.txt queries.txt\n  \
rhammer query -r resolvers.txt -c 8 --output-type jsonl -o found.jsonl.gz queries.txt\n  \
rhammer bench -r resolvers.txt -d example.com"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Issue every question against the resolver pool and print matching records
    #[command(alias = "q")]
    Query(QueryArgs),

    /// Fixed-window send-rate self-test using random throwaway labels
    #[command(alias = "b")]
    Bench(BenchArgs),

    /// List local interface addresses usable with --bind
    #[command(alias = "i")]
    Interfaces,
}

/// Args shared by the query and bench subcommands.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// File with one resolver IP per line (# starts a comment)
    #[arg(short = 'r', long = "resolvers")]
    pub resolvers: PathBuf,

    /// Concurrent requests per resolver
    #[arg(short = 'c', long = "concurrent", default_value_t = 2)]
    pub concurrent: u32,

    /// Per-query timeout in whole seconds
    #[arg(long = "timeout", default_value_t = 6)]
    pub timeout: u64,

    /// Resolver UDP port
    #[arg(long = "port", default_value_t = 53)]
    pub port: u16,

    /// Local address to bind the UDP socket to
    #[arg(long = "bind")]
    pub bind: Option<IpAddr>,

    /// Log level: error|warn|info|debug|silent
    #[arg(long = "log-level", default_value = "info", value_parser = ["error", "warn", "info", "debug", "silent"])]
    pub log_level: String,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// File with one DNS question per line: <name> [class] <type>
    #[arg(value_name = "QUERIES")]
    pub queries: PathBuf,

    /// Retries per query after a timeout (negative = unlimited)
    #[arg(long = "retry", default_value_t = 3)]
    pub retry: i32,

    /// Return a timed-out slot to the resolver's capacity pool instead of
    /// treating the resolver as suspect
    #[arg(long = "keep-capacity")]
    pub keep_capacity: bool,

    /// Output file (.gz suffix enables compression)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Output format: txt/jsonl
    #[arg(long = "output-type", default_value = "txt")]
    pub output_type: String,

    /// Force gzip compression of the output file
    #[arg(long = "gzip")]
    pub gzip: bool,

    /// Append to the output file instead of truncating it
    #[arg(long = "append")]
    pub append: bool,

    /// Disable the periodic status line
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Status line interval in seconds
    #[arg(long = "progress-interval", default_value_t = 1)]
    pub progress_interval: u64,

    /// Colorize the status line
    #[arg(long = "color")]
    pub color: bool,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Root domain the throwaway labels are generated under
    #[arg(short = 'd', long = "domain", default_value = "example.com")]
    pub domain: String,

    /// Measurement window in seconds
    #[arg(long = "window", default_value_t = 3)]
    pub window: u64,

    /// Number of pre-generated questions
    #[arg(long = "count", default_value_t = 20000)]
    pub count: usize,
}

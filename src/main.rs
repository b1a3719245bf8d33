use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;

use rhammer::cli::{Cli, Commands};
use rhammer::options::{parse_question_list, parse_resolver_list, Options};
use rhammer::{bench, device, driver};

fn init_logger(level: &str) {
    let filter = if level == "silent" { "off" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Query(args) => {
            init_logger(&args.common.log_level);
            let resolvers = {
                let f = File::open(&args.common.resolvers).with_context(|| {
                    format!("failed to open {}", args.common.resolvers.display())
                })?;
                parse_resolver_list(BufReader::new(f), args.common.port)?
            };
            let questions = {
                let f = File::open(&args.queries)
                    .with_context(|| format!("failed to open {}", args.queries.display()))?;
                parse_question_list(BufReader::new(f))?
            };

            let opt = Options {
                resolvers,
                questions,
                concurrent: args.common.concurrent,
                timeout: args.common.timeout,
                retry: args.retry,
                keep_capacity: args.keep_capacity,
                quiet: args.quiet,
                output: args.output,
                output_type: args.output_type,
                gzip: args.gzip,
                append: args.append,
                bind: args.common.bind,
                progress_interval: args.progress_interval,
                color: args.color,
            };
            driver::run(opt).await?;
        }
        Commands::Bench(args) => {
            init_logger(&args.common.log_level);
            let f = File::open(&args.common.resolvers).with_context(|| {
                format!("failed to open {}", args.common.resolvers.display())
            })?;
            let resolvers = parse_resolver_list(BufReader::new(f), args.common.port)?;
            bench::run(&args, resolvers).await?;
        }
        Commands::Interfaces => device::list_interfaces()?,
    }

    Ok(())
}

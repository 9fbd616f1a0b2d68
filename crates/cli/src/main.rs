mod cmd;

use std::{fs::File, io::BufReader, path::PathBuf};

use anyhow::{Context, Result};
use argp::FromArgs;
use terrapin_core::config::Config;
use terrapin_db::Database;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(FromArgs, PartialEq, Debug)]
/// Administer a terrapin server's database.
struct TopLevel {
    #[argp(option, short = 'c', default = "PathBuf::from(\"config.yml\")")]
    /// server config file (default: config.yml)
    config: PathBuf,
    #[argp(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Locks(cmd::locks::Args),
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to warn, output goes to stdout
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    if let Err(e) = run(args).await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run(args: TopLevel) -> Result<()> {
    let config: Config = {
        let file = File::open(&args.config)
            .with_context(|| format!("Failed to open {}", args.config.display()))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", args.config.display()))?
    };
    let db = Database::new(&config.db).await?;
    let result = match args.command {
        SubCommand::Locks(locks) => cmd::locks::run(locks, &db, &mut std::io::stdout()).await,
    };
    db.close().await;
    result
}

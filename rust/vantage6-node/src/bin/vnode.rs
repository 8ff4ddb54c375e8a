use std::{mem, path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vantage6_node::settings::Settings;

#[derive(Debug, StructOpt)]
#[structopt(name = "vnode")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let mut settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let filter = mem::replace(&mut settings.log.filter, EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();

    tokio::select! {
        outcome = vantage6_node::run(settings) => {
            outcome?;
            warn!("shutting down: node terminated");
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }
    Ok(())
}

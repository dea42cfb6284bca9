use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use zhimi_ac_tools::commands;

const LOG_FILTER_VARIABLE: &str = "ZHIMI_AC_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Properties(commands::properties::Args),
    Status(commands::status::Args),
    Info(commands::info::Args),
    Climate(commands::climate::Args),
    Set(commands::set::Args),
    Watch(commands::watch::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

#[tokio::main]
async fn main() {
    let filter_description = std::env::var(LOG_FILTER_VARIABLE).unwrap_or_else(|_| "info".into());
    let filter = match filter_description.parse::<tracing_subscriber::filter::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_FILTER_VARIABLE} is not a valid log filter");
            eprintln!("  because: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Properties(args) => end(commands::properties::run(args)),
        Commands::Status(args) => end(commands::status::run(args).await),
        Commands::Info(args) => end(commands::info::run(args).await),
        Commands::Climate(args) => end(commands::climate::run(args).await),
        Commands::Set(args) => end(commands::set::run(args).await),
        Commands::Watch(args) => end(commands::watch::run(args).await),
    }
}

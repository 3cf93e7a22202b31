use clap::Parser;
use tracing_subscriber::EnvFilter;

use wd_cli::{Cli, Commands};
use wd_core::EngineError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Start(args) => args.run().await,
        Commands::Stop(args) => wd_cli::stop::run(args).await,
        Commands::Remove(args) => args.run().await,
        Commands::Connect(args) => args.run().await,
        Commands::List(args) => args.run().await,
        Commands::Login(args) => args.run().await,
    };

    if let Err(err) = result {
        eprintln!("error: {:#}", err);
        let code = err
            .downcast_ref::<EngineError>()
            .map(EngineError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

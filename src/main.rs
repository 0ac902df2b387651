use std::process::ExitCode;

use clap::Parser as _;
use jwks_bearer::client::TokenResult;
use jwks_bearer::config::{
    ClientConfig, Cli, Commands, Configuration, ServerConfig,
};
use jwks_bearer::error::Result;
use jwks_bearer::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::setup_logging();

    let cli = Cli::parse();
    let result = match Configuration::read(cli.config.as_deref()) {
        Ok(file) => match cli.cmd {
            Commands::Token(args) => token(ClientConfig::new(args, file)).await,
            Commands::Serve(args) => serve(ServerConfig::new(args, file)).await,
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        },
    }
}

async fn token(config: Result<ClientConfig>) -> Result<ExitCode> {
    match jwks_bearer::request_token(&config?).await? {
        TokenResult::Granted(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(ExitCode::SUCCESS)
        },
        TokenResult::Rejected { status, body } => {
            tracing::error!(%status, "failed to get access token");
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::FAILURE)
        },
    }
}

async fn serve(config: Result<ServerConfig>) -> Result<ExitCode> {
    jwks_bearer::serve(config?).await?;
    Ok(ExitCode::SUCCESS)
}

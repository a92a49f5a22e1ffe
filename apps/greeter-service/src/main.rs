use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use svckit::features::tracker;
use svckit::server::http::HttpServiceOptions;
use svckit::server::native::NativeServiceOptions;
use svckit::ServiceBuilder;
use svckit_bootstrap::Definitions;

mod greeter;

use greeter::Greeter;

/// Greeter - sample svckit service with HTTP routes and a background reporter
#[derive(Parser)]
#[command(name = "greeter-service")]
#[command(about = "Greeter - sample svckit service with HTTP routes and a background reporter")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the service definitions file (TOML or YAML)
    #[arg(short, long, default_value = "service.toml")]
    definitions: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service
    Run,
    /// Validate the definitions and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&cli.definitions).await,
        Commands::Check => check_definitions(&cli.definitions),
    }
}

async fn run_service(path: &Path) -> Result<()> {
    let service = ServiceBuilder::from_file(path)?
        .with_service(HttpServiceOptions::new(greeter::routes))
        .with_service(NativeServiceOptions::new::<Greeter>())
        .with_features(tracker::features())
        .build()?;

    // signals-driven shutdown; fatal errors end the process
    service.start(Arc::new(Greeter::default())).await;
    Ok(())
}

fn check_definitions(path: &Path) -> Result<()> {
    let definitions = Definitions::load(path)?;
    definitions.validate_all()?;

    println!("Definitions are valid");
    println!("{}", definitions.to_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_accepts_bundled_definitions() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("service.toml");
        check_definitions(&path).unwrap();
    }

    #[test]
    fn check_rejects_unknown_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(
            &path,
            r#"
name = "greeter"
types = ["websocket"]
version = "v0.1.0"
product = "svckit-samples"
"#,
        )
        .unwrap();

        let err = check_definitions(&path).unwrap_err();
        assert!(err.to_string().contains("websocket"));
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use aulas_import::{ImportActor, Importer};
use aulas_store::{RestStore, StoreConfig};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "aulas")]
#[command(about = "Servicio de consulta de aulas y asignaciones docentes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the JSON API server (default).
    Serve,
    /// Parse a workbook and replace the stored assignment set.
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("AULAS_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => aulas_web::serve_from_env().await?,
        Commands::Import { file } => {
            let config = StoreConfig::from_env().context(
                "AULAS_STORE_URL y AULAS_STORE_KEY deben estar configuradas para importar",
            )?;
            let store = Arc::new(RestStore::new(&config)?);
            let importer = Importer::new(store.clone(), store);
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("no se pudo leer {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file.display().to_string());
            let actor = ImportActor {
                client_id: None,
                user_agent: Some("aulas-cli".to_string()),
            };
            let outcome = importer.import(&filename, &bytes, &actor).await?;
            println!(
                "importación completa: run_id={} anteriores={} nuevos={} docentes={} errores={}",
                outcome.run_id,
                outcome.previous_count,
                outcome.new_count,
                outcome.distinct_docentes,
                outcome.errors.len()
            );
            for error in &outcome.errors {
                eprintln!("  aviso: {error}");
            }
        }
    }

    Ok(())
}

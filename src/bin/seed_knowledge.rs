use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ragdesk::{
    config, embedding::build_embedding_client, knowledge, knowledge::SeedOutcome, logging,
    qdrant::QdrantService,
};

#[derive(Parser)]
#[command(
    name = "seed-knowledge",
    about = "Load the shared knowledge corpus into the global collection"
)]
struct Cli {
    /// Corpus file; defaults to KNOWLEDGE_PATH.
    #[arg(long)]
    path: Option<PathBuf>,
    /// Target collection; defaults to GLOBAL_COLLECTION_NAME.
    #[arg(long)]
    collection: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();
    let config = config::init_config().context("Failed to load configuration")?;

    let store = QdrantService::new(&config.qdrant_url, config.qdrant_api_key.clone())
        .context("Failed to create Qdrant client")?;
    let embedder = build_embedding_client(config).context("Failed to create embedding client")?;

    let path = cli.path.unwrap_or_else(|| config.knowledge_path.clone());
    let collection = cli
        .collection
        .unwrap_or_else(|| config.global_collection_name.clone());

    let outcome = knowledge::seed_global_knowledge(&store, embedder.as_ref(), &collection, &path)
        .await
        .with_context(|| format!("Failed to seed '{collection}' from {}", path.display()))?;

    match outcome {
        SeedOutcome::AlreadyPopulated(existing) => {
            println!("{collection} already holds {existing} passages; nothing to do");
        }
        SeedOutcome::SourceMissing => println!("{} not found; nothing ingested", path.display()),
        SeedOutcome::NoRecords => println!("{} has no usable records", path.display()),
        SeedOutcome::Ingested { written, skipped } => {
            println!("Wrote {written} passages to {collection} ({skipped} records skipped)");
        }
    }
    Ok(())
}

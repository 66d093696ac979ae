//! ormgraph-gen: Print the GraphQL schema generated from a model manifest
//!
//! This tool reads a TOML manifest of model descriptors and emits either:
//! - the GraphQL SDL of the full schema (queries, mutations, filters, payloads)
//! - `async-graphql` derive structs for the generated object and input types

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod manifest;

use manifest::Manifest;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    /// GraphQL schema definition language
    Sdl,
    /// Rust source with async-graphql derives
    Rust,
}

#[derive(Parser, Debug)]
#[command(name = "ormgraph-gen")]
#[command(about = "Generate a GraphQL schema from ORM model metadata")]
struct Args {
    /// Manifest file with `[settings]` and `[[models]]` tables
    manifest: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "sdl")]
    format: Format,

    /// Output file path; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let manifest = Manifest::load(&args.manifest)?;
    if manifest.models.is_empty() {
        eprintln!("No models found in {}", args.manifest.display());
        return Ok(());
    }
    let model_count = manifest.models.len();
    let builder = manifest.into_builder()?;

    let output = match args.format {
        Format::Sdl => builder.schema()?.sdl(),
        Format::Rust => ormgraph::codegen::render_types(&builder.plan()?.types)?,
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &output)?;
            info!(path = %path.display(), models = model_count, "wrote generated schema");
            eprintln!("Generated {} for {} models", path.display(), model_count);
        }
        None => print!("{output}"),
    }

    Ok(())
}

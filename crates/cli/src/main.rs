use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use recall_store::{Chunk, HashEmbedder, RetrievalStore, DEFAULT_HASH_DIMENSION};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Per-user semantic retrieval store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store root directory (one subdirectory per namespace)
    #[arg(long, global = true, env = "RECALL_STORE_DIR", default_value = ".recall_store")]
    store_dir: PathBuf,

    /// Embedding dimension for the built-in hash embedder
    #[arg(long, global = true, default_value_t = DEFAULT_HASH_DIMENSION)]
    dimension: usize,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace all chunks of a source from a JSON chunk file
    Upsert(UpsertArgs),
    /// Remove all chunks of a source
    Delete(SourceArgs),
    /// Top-k semantic search over a namespace
    Search(SearchArgs),
    /// List sources with chunk counts
    Sources(NamespaceArgs),
}

#[derive(Args)]
struct NamespaceArgs {
    /// Namespace (one per user)
    #[arg(short, long)]
    namespace: String,
}

#[derive(Args)]
struct SourceArgs {
    #[command(flatten)]
    namespace: NamespaceArgs,

    /// Source label, e.g. the originating filename
    #[arg(short, long)]
    source: String,
}

#[derive(Args)]
struct UpsertArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Path to a JSON array of chunks: [{"text": "...", "meta": {...}}, ...]
    #[arg(short, long)]
    chunks: PathBuf,

    /// Default metadata applied to every chunk, as key=value
    #[arg(short, long, value_parser = parse_key_value)]
    meta: Vec<(String, String)>,
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    namespace: NamespaceArgs,

    /// Query text
    #[arg(short, long)]
    query: String,

    /// Number of results
    #[arg(short, default_value_t = 5)]
    k: usize,

    /// Also print a per-source tally of the hits
    #[arg(long)]
    trace: bool,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let store = RetrievalStore::new(&cli.store_dir, Arc::new(HashEmbedder::new(cli.dimension)));

    match cli.command {
        Commands::Upsert(args) => {
            let raw = tokio::fs::read(&args.chunks)
                .await
                .with_context(|| format!("read chunk file {}", args.chunks.display()))?;
            let chunks: Vec<Chunk> =
                serde_json::from_slice(&raw).context("parse chunk file as JSON array")?;
            let metadata: BTreeMap<String, String> = args.meta.into_iter().collect();

            let added = store
                .upsert(
                    &args.source.namespace.namespace,
                    &args.source.source,
                    chunks,
                    metadata,
                )
                .await?;
            println!("{}", serde_json::json!({ "added": added }));
        }
        Commands::Delete(args) => {
            let removed = store.delete(&args.namespace.namespace, &args.source).await?;
            println!("{}", serde_json::json!({ "removed": removed }));
        }
        Commands::Search(args) => {
            if args.trace {
                let (hits, tally) = store
                    .search_with_trace(&args.namespace.namespace, &args.query, args.k)
                    .await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "hits": hits,
                        "sources": tally,
                    }))?
                );
            } else {
                let hits = store
                    .search(&args.namespace.namespace, &args.query, args.k)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&hits)?);
            }
        }
        Commands::Sources(args) => {
            let sources = store.list_sources(&args.namespace).await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::info;
use std::env;
use std::path::PathBuf;

use ollama_rag::chunking::{SplitterConfig, TextSplitter};
use ollama_rag::cli;
use ollama_rag::database::{VectorStoreConfig, VectorStoreKind};
use ollama_rag::ollama::{OllamaClient, OllamaConfig};
use ollama_rag::rag::{self, QaHandler};

/// Chat with a local Ollama model, optionally grounded in a PDF, TXT or DOCX document
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Document to load before the chat starts
    #[arg(index = 1)]
    file_path: Option<PathBuf>,

    /// Model used for answers [env: OLLAMA_MODEL, default: gemma3:4b]
    #[arg(short, long)]
    model: Option<String>,

    /// Ollama server address [env: OLLAMA_BASE_URL, default: http://localhost:11434]
    #[arg(long)]
    base_url: Option<String>,

    /// Model used to embed chunks and questions [env: OLLAMA_EMBED_MODEL, default: all-minilm]
    #[arg(long)]
    embed_model: Option<String>,

    /// Where chunk embeddings are indexed: memory or qdrant [env: RAG_VECTOR_STORE]
    #[arg(long)]
    vector_store: Option<VectorStoreKind>,

    /// Answer a single question and exit
    #[arg(short, long)]
    ask: Option<String>,

    /// Print the models available on the server and exit
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    // Load configuration from environment, command line flags take precedence
    let mut ollama_config = OllamaConfig::from_env();
    if let Some(base_url) = args.base_url {
        ollama_config.base_url = base_url;
    }
    if let Some(model) = args.model {
        ollama_config.model = model;
    }
    if let Some(embed_model) = args.embed_model {
        ollama_config.embed_model = embed_model;
    }

    let store_kind = match args.vector_store {
        Some(kind) => kind,
        None => env::var("RAG_VECTOR_STORE")
            .ok()
            .map(|v| v.parse::<VectorStoreKind>())
            .transpose()
            .map_err(anyhow::Error::msg)?
            .unwrap_or_default(),
    };
    let store_config =
        VectorStoreConfig::for_kind(store_kind).context("Invalid vector store configuration")?;
    let splitter = TextSplitter::new(SplitterConfig::from_env()?)?;
    let top_k = rag::top_k_from_env()?;

    info!("Connecting to Ollama at {}", ollama_config.base_url);
    let mut ollama = OllamaClient::connect(ollama_config).await;
    ollama.fallback_to_available_model();

    let mut handler = QaHandler::new(ollama, splitter, store_config).with_top_k(top_k);

    if args.list_models {
        cli::print_models(&handler);
        return Ok(());
    }

    info!(
        "Using model {} with {} vector store",
        handler.current_model(),
        store_kind
    );

    if let Some(path) = args.file_path {
        if !path.exists() {
            return Err(anyhow::anyhow!("File not found: {}", path.display()));
        }
        cli::upload(&mut handler, &path).await;
    }

    if let Some(question) = args.ask {
        println!("{}", handler.get_response(&question).await);
        return Ok(());
    }

    // Enter interactive chat loop
    cli::run_query_loop(&mut handler)
        .await
        .context("Error in query loop")?;

    Ok(())
}

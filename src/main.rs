use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use miette::{Context, IntoDiagnostic, Result};
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use lumen_core::{
    LumenConfig, LumenError, Metadata, MetadataFilter, OutputFormat, PromptProviderType,
    PromptType,
};
use lumen_index::{AnyStore, EmbeddingClient, EmbeddingManager, VectorStore};
use lumen_query::{LlmClient, QueryProcessor, StreamQueryProcessor};

#[derive(Parser)]
#[command(
    name = "lumen",
    version,
    about = "Semantic code search with LLM analysis",
    long_about = "Lumen embeds code chunks into a local vector index and answers questions\n\
                   about them by handing the closest matches to an LLM, batch by batch.\n\n\
                   Examples:\n  \
                     lumen init                               Write a default .lumen.toml\n  \
                     lumen embed --input chunks.jsonl         Index a corpus\n  \
                     lumen query 'how are sessions refreshed?' Analyze matches\n  \
                     lumen query 'retry logic' --stream        Stream the analysis\n  \
                     lumen stats                              Show index size"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .lumen.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text  Human-readable output (default)\n  \
                         json  One JSON object per result, camelCase keys"
    )]
    format: OutputFormat,

    /// Enable debug logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default .lumen.toml in the current directory
    Init,
    /// Embed a JSON Lines corpus into the index
    #[command(long_about = "Embed a JSON Lines corpus into the index.\n\n\
        Each line is an object with a `text` field and an optional `metadata`\n\
        object. The `source` metadata key names the file a chunk came from.\n\
        Chunks already in the index are skipped.\n\n\
        Example line:\n  {\"text\": \"fn main() {}\", \"metadata\": {\"source\": \"src/main.rs\"}}")]
    Embed {
        /// Corpus file (JSON Lines)
        #[arg(long, short)]
        input: PathBuf,
    },
    /// Search the index and analyze the matches with the LLM
    Query {
        /// Natural-language question
        text: String,

        /// Print the analysis as it is generated
        #[arg(long)]
        stream: bool,

        /// One prompt per batch (aggregate) or per file (file_wise)
        #[arg(long)]
        prompt_type: Option<PromptType>,

        /// Prompt style: semantic or code_pattern
        #[arg(long)]
        prompt_provider: Option<PromptProviderType>,

        /// Metadata filter as key=value; repeat a key to accept several values
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,

        /// Maximum number of matches to analyze
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Show index statistics
    Stats,
    /// Remove entries by id
    Delete {
        /// Entry ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Remove every entry from the index
    Clear,
}

#[derive(Deserialize)]
struct CorpusRecord {
    text: String,
    #[serde(default)]
    metadata: Metadata,
}

const DEFAULT_CONFIG: &str = r#"# Lumen configuration

[embedding]
provider = "voyage"           # voyage | openai
model = "voyage-code-3"
dimension = 1024
batch_size = 64
# api_key = "..."             # or VOYAGE_API_KEY / OPENAI_API_KEY
# base_url = "https://api.voyageai.com/v1"

[store]
store_type = "in-memory-index"  # in-memory-index | embedded-doc-store | relational-vector
persist_location = ".lumen/index"   # "" keeps the index in memory only

[llm]
provider = "openai"           # openai | ollama
model = "gpt-4o-mini"
temperature = 0.7
# max_tokens = 2048
# base_url = "http://localhost:11434"   # any OpenAI-compatible server

[query]
max_results = 10
batch_size = 5
prompt_type = "aggregate"     # aggregate | file_wise
prompt_provider = "semantic"  # semantic | code_pattern
# min_score = 0.2

[retry]
max_attempts = 3
base_delay_ms = 4000
max_delay_ms = 10000
"#;

fn load_config(path: Option<&Path>) -> Result<LumenConfig> {
    let config = match path {
        Some(path) => LumenConfig::from_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => {
            let default_path = Path::new(".lumen.toml");
            if default_path.exists() {
                debug!(path = %default_path.display(), "loading config");
                LumenConfig::from_file(default_path)?
            } else {
                debug!("no .lumen.toml, using defaults");
                LumenConfig::default()
            }
        }
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spinner(message: &'static str) -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    Some(pb)
}

fn open_store(config: &LumenConfig) -> Result<Arc<AnyStore>> {
    let store = AnyStore::open(&config.store, config.effective_dimension())?;
    Ok(Arc::new(store))
}

fn open_manager(config: &LumenConfig) -> Result<EmbeddingManager> {
    let client = EmbeddingClient::with_config(&config.embedding, config.retry.to_policy())?;
    Ok(EmbeddingManager::new(Arc::new(client), open_store(config)?)?)
}

fn read_corpus(path: &Path) -> Result<(Vec<String>, Vec<Metadata>)> {
    let file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LumenError::FileNotFound(path.to_path_buf()),
        _ => LumenError::Io(e),
    })?;
    let mut texts = Vec::new();
    let mut metadatas = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.into_diagnostic()?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CorpusRecord = serde_json::from_str(&line).map_err(|e| {
            LumenError::InvalidInput(format!("{}:{}: {e}", path.display(), n + 1))
        })?;
        texts.push(record.text);
        metadatas.push(record.metadata);
    }
    Ok((texts, metadatas))
}

async fn run_query(
    config: &LumenConfig,
    text: &str,
    stream: bool,
    filter: Option<MetadataFilter>,
    format: OutputFormat,
) -> Result<()> {
    let manager = open_manager(config)?;
    info!(
        model = %config.llm.model,
        stream,
        filtered = filter.is_some(),
        "running query"
    );
    let llm = Arc::new(LlmClient::new(&config.llm, config.retry.to_policy())?);
    let mut stdout = std::io::stdout().lock();

    if stream {
        let processor = StreamQueryProcessor::new(manager, llm, config.query.clone());
        let mut fragments = processor.stream(text, filter);
        let mut current = None;
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            match format {
                OutputFormat::Json => {
                    writeln!(stdout, "{}", serde_json::to_string(&fragment).into_diagnostic()?)
                        .into_diagnostic()?;
                }
                OutputFormat::Text => {
                    if current != Some(fragment.batch_index) {
                        if current.is_some() {
                            writeln!(stdout).into_diagnostic()?;
                        }
                        writeln!(stdout, "── Batch {} ──", fragment.batch_index + 1)
                            .into_diagnostic()?;
                        current = Some(fragment.batch_index);
                    }
                    write!(stdout, "{}", fragment.text).into_diagnostic()?;
                    stdout.flush().into_diagnostic()?;
                }
            }
        }
        match current {
            Some(_) => writeln!(stdout).into_diagnostic()?,
            None if format == OutputFormat::Text => {
                writeln!(stdout, "No matches found.").into_diagnostic()?;
            }
            None => {}
        }
        return Ok(());
    }

    let processor = QueryProcessor::new(manager, llm, config.query.clone());
    let mut results = processor.process(text, filter);
    let mut any = false;
    loop {
        let pb = spinner("Analyzing matches...");
        let next = results.next().await;
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        let Some(result) = next else { break };
        let result = result?;
        any = true;
        match format {
            OutputFormat::Json => {
                writeln!(stdout, "{}", serde_json::to_string(&result).into_diagnostic()?)
                    .into_diagnostic()?;
            }
            OutputFormat::Text => {
                writeln!(
                    stdout,
                    "── Batch {} ({}) ──\n{}\n",
                    result.batch_index + 1,
                    result.source_files.join(", "),
                    result.content
                )
                .into_diagnostic()?;
            }
        }
    }
    if !any && format == OutputFormat::Text {
        writeln!(stdout, "No matches found.").into_diagnostic()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::Init = cli.command {
        let path = Path::new(".lumen.toml");
        if path.exists() {
            miette::bail!(".lumen.toml already exists");
        }
        std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
        println!("Created .lumen.toml with default configuration");
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Init => {}
        Command::Embed { ref input } => {
            let (texts, metadatas) = read_corpus(input)?;
            info!(path = %input.display(), chunks = texts.len(), "corpus read");
            let manager = open_manager(&config)?;
            let pb = spinner("Embedding corpus...");
            let ids = manager
                .add_texts(&texts, Some(&metadatas))
                .await
                .inspect_err(|_| {
                    if let Some(pb) = &pb {
                        pb.finish_with_message("Failed");
                    }
                })?;
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&ids).into_diagnostic()?);
                }
                OutputFormat::Text => {
                    let stats = manager.stats()?;
                    println!(
                        "Embedded {} chunks ({} entries in index)",
                        ids.len(),
                        stats.count
                    );
                }
            }
        }
        Command::Query {
            ref text,
            stream,
            prompt_type,
            prompt_provider,
            ref filters,
            max_results,
        } => {
            let mut config = config;
            if let Some(prompt_type) = prompt_type {
                config.query.prompt_type = prompt_type;
            }
            if let Some(prompt_provider) = prompt_provider {
                config.query.prompt_provider = prompt_provider;
            }
            if let Some(max_results) = max_results {
                if max_results == 0 {
                    miette::bail!("--max-results must be at least 1");
                }
                config.query.max_results = max_results;
            }
            let filter = MetadataFilter::from_pairs(filters).map_err(LumenError::InvalidInput)?;
            let filter = (!filter.is_empty()).then_some(filter);
            run_query(&config, text, stream, filter, cli.format).await?;
        }
        Command::Stats => {
            let stats = open_store(&config)?.stats()?;
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&stats).into_diagnostic()?);
                }
                OutputFormat::Text => print!("{stats}"),
            }
        }
        Command::Delete { ref ids } => {
            let removed = open_store(&config)?.delete(ids)?;
            info!(requested = ids.len(), removed, "entries deleted");
            match cli.format {
                OutputFormat::Json => println!("{{\"removed\":{removed}}}"),
                OutputFormat::Text => println!("Removed {removed} of {} entries", ids.len()),
            }
        }
        Command::Clear => {
            open_store(&config)?.clear()?;
            info!("index cleared");
            if cli.format == OutputFormat::Text {
                println!("Index cleared");
            }
        }
    }

    Ok(())
}

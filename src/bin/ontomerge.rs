//! OntoMerge CLI — concept consolidation over a document batch.
//!
//! Usage:
//!   ontomerge run <input.jsonl> --graph URL --oracle URL --embedder URL [--resume]
//!   ontomerge commit [--staging FILE | --table FILE] --graph URL --embedder URL
//!   ontomerge rollback [--backup NAME] [--yes] --graph URL
//!   ontomerge backups

use clap::{Parser, Subcommand};
use ontomerge::candidate::cluster::{ClusterEngine, ClusterParams};
use ontomerge::{
    BatchRunner, CandidateRepository, CheckpointManager, ConceptMatcher, ConsolidationConfig,
    Coordinator, EmbeddingStore, HttpEmbedder, HttpOracle, OntologyGraphManager,
    SparqlGraphStore, StagedConcept, StagingChangeSet,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const DEFAULT_GRAPH: &str = "http://localhost:7200/repositories/ontology";

#[derive(Parser)]
#[command(
    name = "ontomerge",
    version,
    about = "Concept consolidation engine for growing ontologies"
)]
struct Cli {
    /// Data directory for stores, checkpoints, and backups
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a JSONL batch of observed keywords
    Run {
        /// Input batch file (one JSON object per line)
        input: PathBuf,
        /// SPARQL endpoint of the ontology graph
        #[arg(long, default_value = DEFAULT_GRAPH)]
        graph: String,
        /// Oracle judgment service endpoint
        #[arg(long)]
        oracle: String,
        /// Embedding service endpoint
        #[arg(long)]
        embedder: String,
        /// Embedding dimensionality
        #[arg(long, default_value_t = 384)]
        embedding_dim: usize,
        /// Root concept id
        #[arg(long, default_value = "Root")]
        root: String,
        /// Optional config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Resume from the newest checkpoint for this input
        #[arg(long)]
        resume: bool,
        /// Directory for run artifacts
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Commit reviewed staged concepts to the durable stores
    Commit {
        /// Staged concepts JSON (defaults to the last run's artifact)
        #[arg(long)]
        staging: Option<PathBuf>,
        /// Tab-separated table: concept_id, label, parent_id, description
        #[arg(long, conflicts_with = "staging")]
        table: Option<PathBuf>,
        /// SPARQL endpoint of the ontology graph
        #[arg(long, default_value = DEFAULT_GRAPH)]
        graph: String,
        /// Embedding service endpoint
        #[arg(long)]
        embedder: String,
        /// Embedding dimensionality
        #[arg(long, default_value_t = 384)]
        embedding_dim: usize,
        /// Oracle endpoint, used to fill in missing descriptions
        #[arg(long)]
        oracle: Option<String>,
    },
    /// Restore all stores from a backup
    Rollback {
        /// Backup name (defaults to the newest)
        #[arg(long)]
        backup: Option<String>,
        /// SPARQL endpoint of the ontology graph
        #[arg(long, default_value = DEFAULT_GRAPH)]
        graph: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List available backups
    Backups,
}

/// Default data directory (~/.local/share/ontomerge)
fn default_data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    data_dir.join("ontomerge")
}

fn open_stores(data_dir: &Path) -> Result<(Arc<EmbeddingStore>, Arc<CandidateRepository>), String> {
    std::fs::create_dir_all(data_dir).map_err(|e| format!("cannot create data dir: {}", e))?;
    let embeddings = EmbeddingStore::open(data_dir.join("vectors.db"))
        .map_err(|e| format!("failed to open vector store: {}", e))?;
    let candidates = CandidateRepository::open(data_dir.join("candidates.db"))
        .map_err(|e| format!("failed to open candidate repository: {}", e))?;
    Ok((Arc::new(embeddings), Arc::new(candidates)))
}

fn load_config(path: Option<&Path>, root: &str) -> Result<ConsolidationConfig, String> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config '{}': {}", path.display(), e))?;
            serde_json::from_str(&raw)
                .map_err(|e| format!("invalid config '{}': {}", path.display(), e))?
        }
        None => ConsolidationConfig::default(),
    };
    config.root_concept = root.to_string();
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    data_dir: &Path,
    input: &Path,
    graph_url: &str,
    oracle_url: &str,
    embedder_url: &str,
    embedding_dim: usize,
    root: &str,
    config_path: Option<&Path>,
    resume: bool,
    output: Option<PathBuf>,
) -> i32 {
    let config = match load_config(config_path, root) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let (embeddings, candidates) = match open_stores(data_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let graph = SparqlGraphStore::with_timeout(graph_url, config.oracle_timeout);
    let mut manager = match OntologyGraphManager::load(&graph, &config.root_concept) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error: failed to load ontology from graph: {}", e);
            return 1;
        }
    };

    let matcher = ConceptMatcher::new(
        embeddings,
        candidates,
        ClusterEngine::new(ClusterParams {
            epsilon: config.cluster_epsilon,
            min_neighbors: config.cluster_min_neighbors,
            resplit_epsilon: config.resplit_epsilon,
            max_cluster_size: config.max_cluster_size,
        }),
        Arc::new(HttpEmbedder::new(embedder_url, embedding_dim)),
        Arc::new(HttpOracle::with_timeout(oracle_url, config.oracle_timeout)),
        config,
    );
    let runner = BatchRunner::new(
        matcher,
        CheckpointManager::new(data_dir.join("checkpoints")),
        output.unwrap_or_else(|| data_dir.join("out")),
    );

    let interrupt = runner.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; finishing current item and checkpointing...");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    match runner.run(&mut manager, input, resume).await {
        Ok(report) => {
            println!(
                "Processed {} items ({} malformed skipped), {} matches, {} promoted, {} rematched",
                report.processed,
                report.skipped_malformed,
                report.matched_total,
                report.promoted.len(),
                report.rematched,
            );
            println!("Output:  {}", report.output_path.display());
            println!("Staging: {}", report.staging_path.display());
            if report.interrupted {
                println!("Run interrupted; resume with --resume");
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("A checkpoint was saved if any items completed; resume with --resume");
            1
        }
    }
}

/// Parse a reviewer's tab-separated commit table.
fn parse_table(path: &Path) -> Result<Vec<StagedConcept>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read table '{}': {}", path.display(), e))?;
    let mut staged = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (lineno == 0 && line.starts_with("concept_id")) {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 3 {
            return Err(format!(
                "line {}: expected at least 3 tab-separated columns",
                lineno + 1
            ));
        }
        staged.push(StagedConcept {
            concept_id: cols[0].to_string(),
            label: cols[1].to_string(),
            parent_id: cols[2].to_string(),
            description: cols.get(3).unwrap_or(&"").to_string(),
            original_keywords: vec![],
            parent_candidates: vec![cols[2].to_string()],
            parent_reason: String::new(),
        });
    }
    Ok(staged)
}

async fn cmd_commit(
    data_dir: &Path,
    staging: Option<PathBuf>,
    table: Option<PathBuf>,
    graph_url: &str,
    embedder_url: &str,
    embedding_dim: usize,
    oracle_url: Option<&str>,
) -> i32 {
    let staged = if let Some(table) = table {
        match parse_table(&table) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        let path = staging.unwrap_or_else(|| data_dir.join("out/staging_concepts.json"));
        match std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))
            .and_then(|raw| {
                serde_json::from_str::<Vec<StagedConcept>>(&raw)
                    .map_err(|e| format!("invalid staging file '{}': {}", path.display(), e))
            }) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    };
    if staged.is_empty() {
        println!("Nothing to commit.");
        return 0;
    }

    let (embeddings, candidates) = match open_stores(data_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let coordinator = Coordinator::new(
        embeddings,
        candidates,
        Arc::new(SparqlGraphStore::new(graph_url)),
        data_dir.join("backups"),
    );
    let embedder = HttpEmbedder::new(embedder_url, embedding_dim);
    let oracle = oracle_url.map(HttpOracle::new);

    let change_set = StagingChangeSet::from_staged(&staged);
    match coordinator
        .commit(
            &change_set,
            &embedder,
            oracle.as_ref().map(|o| o as &dyn ontomerge::ConceptOracle),
        )
        .await
    {
        Ok(report) => {
            println!("Backup: {}", report.backup_name);
            println!(
                "Applied {} concepts, {} relations",
                report.applied.len(),
                report.relations_added
            );
            for id in &report.applied {
                println!("  + {}", id);
            }
            if !report.skipped.is_empty() {
                println!("Skipped {}:", report.skipped.len());
                for skip in &report.skipped {
                    println!("  - {}: {}", skip.concept_id, skip.reason);
                }
            }
            0
        }
        Err(e) => {
            eprintln!("Error: commit failed: {}", e);
            1
        }
    }
}

fn cmd_rollback(data_dir: &Path, graph_url: &str, backup: Option<&str>, yes: bool) -> i32 {
    let (embeddings, candidates) = match open_stores(data_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let coordinator = Coordinator::new(
        embeddings,
        candidates,
        Arc::new(SparqlGraphStore::new(graph_url)),
        data_dir.join("backups"),
    );

    let target = match backup {
        Some(name) => name.to_string(),
        None => match coordinator.list_backups() {
            Ok(backups) => match backups.first() {
                Some(b) => b.name.clone(),
                None => {
                    eprintln!("Error: no backups found");
                    return 1;
                }
            },
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        },
    };

    if !yes {
        print!(
            "Roll back to '{}'? This overwrites the stores and the graph. [y/N] ",
            target
        );
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            eprintln!("Aborted.");
            return 1;
        }
        let answer = answer.trim().to_lowercase();
        if answer != "y" && answer != "yes" {
            println!("Aborted.");
            return 1;
        }
    }

    match coordinator.rollback(Some(&target)) {
        Ok(backup) => {
            println!("Rolled back to '{}'", backup.name);
            0
        }
        Err(e) => {
            eprintln!("Error: rollback failed: {}", e);
            1
        }
    }
}

fn cmd_backups(data_dir: &Path, graph_url: &str) -> i32 {
    let (embeddings, candidates) = match open_stores(data_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let coordinator = Coordinator::new(
        embeddings,
        candidates,
        Arc::new(SparqlGraphStore::new(graph_url)),
        data_dir.join("backups"),
    );
    match coordinator.list_backups() {
        Ok(backups) => {
            if backups.is_empty() {
                println!("No backups.");
                return 0;
            }
            println!("{:<36}  PATH", "NAME");
            for backup in backups {
                println!("{:<36}  {}", backup.name, backup.path.display());
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ontomerge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    let code = match cli.command {
        Commands::Run {
            input,
            graph,
            oracle,
            embedder,
            embedding_dim,
            root,
            config,
            resume,
            output,
        } => {
            cmd_run(
                &data_dir,
                &input,
                &graph,
                &oracle,
                &embedder,
                embedding_dim,
                &root,
                config.as_deref(),
                resume,
                output,
            )
            .await
        }
        Commands::Commit {
            staging,
            table,
            graph,
            embedder,
            embedding_dim,
            oracle,
        } => {
            cmd_commit(
                &data_dir,
                staging,
                table,
                &graph,
                &embedder,
                embedding_dim,
                oracle.as_deref(),
            )
            .await
        }
        Commands::Rollback { backup, graph, yes } => {
            cmd_rollback(&data_dir, &graph, backup.as_deref(), yes)
        }
        Commands::Backups => cmd_backups(&data_dir, DEFAULT_GRAPH),
    };
    std::process::exit(code);
}

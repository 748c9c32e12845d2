use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use walkdir::WalkDir;

use toolmesh_analyzer::{GrammarRegistry, Language, SemanticAnalyzer, WorkerPool};
use toolmesh_graph::GraphSnapshot;
use toolmesh_mesh::{
    AuthResolver, CallOptions, ConnectionPool, EnvSecretStore, FanOutOrchestrator, PoolConfig,
    ResponseCache, ServerRegistry, ToolClient,
};
use toolmesh_pipeline::Pipeline;
use toolmesh_protocol::ServerConfig;
use toolmesh_store::{SqliteKnowledgeSink, Store};

#[derive(Parser)]
#[command(name = "toolmesh")]
#[command(about = "Capability-routed tool mesh with local code analysis", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,

    /// Store database path
    #[arg(long, global = true, default_value = ".toolmesh/toolmesh.db")]
    db: PathBuf,

    /// Server registry file (JSON array of server configs)
    #[arg(long, global = true, default_value = "servers.json")]
    servers: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a project and promote its knowledge graph
    Analyze(AnalyzeArgs),
    /// Fan a capability query out across registered servers
    Query(QueryArgs),
    /// Call a single registered server
    Call(CallArgs),
    /// List configured servers
    Servers(ServersArgs),
    /// Show the promoted graph snapshot for a project
    Graph(GraphArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Project root to analyze
    path: PathBuf,

    /// Worker thread count (default: cores minus one)
    #[arg(long)]
    workers: Option<usize>,

    /// Emit the full report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct QueryArgs {
    /// Capability to query, e.g. "documentation"
    capability: String,

    /// Request parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,

    /// Bypass the response cache
    #[arg(long)]
    force_refresh: bool,
}

#[derive(Args)]
struct CallArgs {
    /// Capability to invoke
    capability: String,

    /// Server id to route to (default: best healthy server)
    #[arg(long)]
    server: Option<String>,

    /// Request parameters as a JSON object
    #[arg(long, default_value = "{}")]
    params: String,

    /// Bypass the response cache
    #[arg(long)]
    force_refresh: bool,
}

#[derive(Args)]
struct ServersArgs {
    /// Emit as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct GraphArgs {
    /// Project root the snapshot was promoted for
    path: PathBuf,

    /// Emit the raw snapshot JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    let json_output = match &cli.command {
        Commands::Analyze(args) => args.json,
        Commands::Query(_) | Commands::Call(_) => true,
        Commands::Servers(args) => args.json,
        Commands::Graph(args) => args.json,
    };
    if json_output {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::Analyze(args) => run_analyze(args, &cli.db).await,
        Commands::Query(args) => run_query(args, &cli.db, &cli.servers).await,
        Commands::Call(args) => run_call(args, &cli.servers).await,
        Commands::Servers(args) => run_servers(args, &cli.servers),
        Commands::Graph(args) => run_graph(args, &cli.db),
    }
}

async fn run_analyze(args: AnalyzeArgs, db: &Path) -> Result<()> {
    let project = args
        .path
        .canonicalize()
        .with_context(|| format!("project path {} not found", args.path.display()))?;
    let targets = collect_targets(&project);
    if targets.is_empty() {
        anyhow::bail!("no analyzable files under {}", project.display());
    }

    let store = Arc::new(Store::open(db)?);
    let pool = Arc::new(match args.workers {
        Some(n) => WorkerPool::new(n),
        None => WorkerPool::with_default_size(),
    });
    let analyzer = Arc::new(SemanticAnalyzer::new(Arc::new(GrammarRegistry::new())));
    let pipeline = Pipeline::new(Arc::clone(&store), Arc::clone(&pool), analyzer);

    let report = pipeline.run_analysis(&project, targets).await?;
    pool.dispose();

    if args.json {
        let snapshot = report
            .snapshot
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "job_id": report.job.job_id,
                "status": report.job.status,
                "confidence": report.job.confidence_score,
                "files_completed": report.job.files_completed,
                "files_failed": report.job.files_failed,
                "cache_hits": report.cache_hits,
                "summary": report.summary,
                "snapshot": snapshot,
            }))?
        );
    } else {
        println!("job {}: {}", report.job.job_id, report.job.status.as_str());
        println!(
            "  files: {}/{} analyzed ({} from cache, {} failed)",
            report.job.files_completed,
            report.job.files_total,
            report.cache_hits,
            report.job.files_failed
        );
        println!("  confidence: {:.2}", report.job.confidence_score);
        if let Some(snapshot) = &report.snapshot {
            println!(
                "  graph: {} files, {} symbols, {} edges",
                snapshot.file_count(),
                snapshot.symbol_count(),
                snapshot.edges.len()
            );
        }
        if let Some(stack) = &report.summary.detected_stack {
            println!("  stack: {stack}");
        }
        for failure in &report.failures {
            println!("  failed: {} ({})", failure.file_path, failure.message);
        }
    }
    Ok(())
}

async fn run_query(args: QueryArgs, db: &Path, servers_path: &Path) -> Result<()> {
    let params = parse_params(&args.params)?;
    let registry = load_registry(servers_path)?;
    let client = build_client(Arc::clone(&registry));

    let store = Arc::new(Store::open(db)?);
    let sink = Arc::new(SqliteKnowledgeSink::new(store));
    let orchestrator = FanOutOrchestrator::with_policies(
        client,
        registry,
        Default::default(),
        Default::default(),
        sink,
    );

    let outcome = orchestrator
        .query_with(&args.capability, &params, args.force_refresh)
        .await;
    let successful: Vec<Value> = outcome
        .successful
        .iter()
        .map(|s| json!({"server_id": s.server_id, "response": s.response}))
        .collect();
    let failed: Vec<Value> = outcome
        .failed
        .iter()
        .map(|f| json!({"server_id": f.server_id, "error": f.error}))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "capability": args.capability,
            "successful": successful,
            "failed": failed,
        }))?
    );
    Ok(())
}

async fn run_call(args: CallArgs, servers_path: &Path) -> Result<()> {
    let params = parse_params(&args.params)?;
    let registry = load_registry(servers_path)?;
    let client = build_client(registry);

    let options = CallOptions {
        force_refresh: args.force_refresh,
        server_id: args.server,
    };
    let response = client.call(&args.capability, &params, &options).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn run_servers(args: ServersArgs, servers_path: &Path) -> Result<()> {
    let configs = load_servers(servers_path)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&configs)?);
    } else {
        for config in &configs {
            let mut capabilities: Vec<&str> =
                config.capabilities.iter().map(String::as_str).collect();
            capabilities.sort_unstable();
            println!(
                "{} ({}) priority={} capabilities=[{}] {}",
                config.id,
                config.endpoint,
                config.priority,
                capabilities.join(", "),
                config.name
            );
        }
    }
    Ok(())
}

fn run_graph(args: GraphArgs, db: &Path) -> Result<()> {
    let project = args
        .path
        .canonicalize()
        .with_context(|| format!("project path {} not found", args.path.display()))?;
    let store = Store::open(db)?;
    let row = store
        .get_promoted_graph(&project.to_string_lossy())?
        .with_context(|| format!("no promoted graph for {}", project.display()))?;

    if args.json {
        println!("{}", row.graph_json);
    } else {
        let snapshot = GraphSnapshot::from_json(&row.graph_json)?;
        println!("graph {} (job {})", row.graph_id, row.job_id);
        println!(
            "  {} files, {} symbols, {} edges",
            snapshot.file_count(),
            snapshot.symbol_count(),
            snapshot.edges.len()
        );
        println!("  confidence: {:.2}", row.metadata.confidence);
        if let Some(pattern) = &row.metadata.detected_pattern {
            println!("  pattern: {pattern}");
        }
        if let Some(stack) = &row.metadata.detected_stack {
            println!("  stack: {stack}");
        }
    }
    Ok(())
}

const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "dist",
    "vendor",
    "__pycache__",
    ".venv",
];

fn collect_targets(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir()
                && (SKIPPED_DIRS.contains(&name.as_ref()) || name.starts_with('.')))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| Language::from_path(path).is_supported())
        .collect()
}

fn parse_params(raw: &str) -> Result<Value> {
    let params: Value =
        serde_json::from_str(raw).context("--params must be a valid JSON object")?;
    anyhow::ensure!(params.is_object(), "--params must be a JSON object");
    Ok(params)
}

fn load_servers(path: &Path) -> Result<Vec<ServerConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read server registry {}", path.display()))?;
    let configs: Vec<ServerConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("malformed server registry {}", path.display()))?;
    anyhow::ensure!(!configs.is_empty(), "server registry is empty");
    Ok(configs)
}

fn load_registry(path: &Path) -> Result<Arc<ServerRegistry>> {
    let registry = Arc::new(ServerRegistry::new());
    for config in load_servers(path)? {
        registry.register(config);
    }
    Ok(registry)
}

fn build_client(registry: Arc<ServerRegistry>) -> Arc<ToolClient> {
    Arc::new(ToolClient::new(
        registry,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        Arc::new(ResponseCache::default()),
        AuthResolver::new(Arc::new(EnvSecretStore)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_hidden_and_build_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("target/debug")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(root.join("target/debug/gen.rs"), "pub fn b() {}\n").unwrap();
        fs::write(root.join(".hidden/c.py"), "def c(): pass\n").unwrap();
        fs::write(root.join("notes.txt"), "text\n").unwrap();

        let targets = collect_targets(root);
        assert_eq!(targets.len(), 1);
        assert!(targets[0].ends_with("src/lib.rs"));
    }

    #[test]
    fn params_must_be_an_object() {
        assert!(parse_params("{\"q\": 1}").is_ok());
        assert!(parse_params("[1, 2]").is_err());
        assert!(parse_params("not json").is_err());
    }
}

mod csv_export;
mod graph;
mod loader;
mod paginate;
mod records;
mod snapshot;
mod stats;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use csv_export::{default_table_path, BulkExport};
use graph::{BulkMerge, MergeTarget, Neo4jSession, NodeKey};
use paginate::DEFAULT_PAGE_SIZE;
use snapshot::{find_snapshot_files, load_snapshot, EdgeSnapshot, NodeSnapshot};
use stats::LoadStats;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "citegraph_loader")]
#[command(about = "Load pickled citation-graph snapshots into a graph database")]
struct Cli {
    /// Snapshot files decoded in parallel by bulk-csv (default: all cores)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge citation edges as REF relationships between keyed nodes
    MergeRefs(MergeArgs),
    /// Merge case/paper metadata as keyed nodes
    MergePapers(MergeArgs),
    /// Write a node snapshot as a LOAD CSV source file
    NodeCsv(TableArgs),
    /// Write a citation snapshot as a LOAD CSV source file
    EdgeCsv(TableArgs),
    /// Write bulk-loader node and edge files for every snapshot part in a directory
    BulkCsv(BulkCsvArgs),
    /// Print the bulk-loader request body for an S3-hosted CSV
    LoaderRequest(LoaderArgs),
    /// Time a small read query against the database
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ConnectionArgs {
    /// Bolt URI of the graph database
    #[arg(long, env = "NEO4J_URI", default_value = "bolt://127.0.0.1:7687")]
    uri: String,

    #[arg(long, env = "NEO4J_USER", default_value = "neo4j")]
    user: String,

    #[arg(long, env = "NEO4J_PASSWORD", default_value = "test", hide_env_values = true)]
    pwd: String,
}

#[derive(Args)]
struct MergeArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Snapshot file or glob pattern (`.gz` files are decompressed)
    #[arg(long)]
    fname: String,

    /// Label of the merged nodes
    #[arg(long, default_value = "Paper")]
    label: String,

    /// Relationship type of merged citations
    #[arg(long, default_value = "REF")]
    rel_type: String,

    /// Records per bulk-merge call
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, value_parser = parse_page_size)]
    page_size: usize,
}

#[derive(Args)]
struct TableArgs {
    /// Snapshot file (`.gz` files are decompressed)
    #[arg(long)]
    fname: PathBuf,

    /// Output CSV (default: `<fname>.csv`)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct BulkCsvArgs {
    /// Directory holding `part_*_metadata.*` and `part_*_cite.*` snapshots
    #[arg(long)]
    basedir: String,

    #[arg(long, default_value = "nodes.csv")]
    nodes_output: PathBuf,

    #[arg(long, default_value = "edges.csv")]
    edges_output: PathBuf,

    #[arg(long, default_value = "Case")]
    label: String,

    #[arg(long, default_value = "REF")]
    rel_type: String,

    /// Only write id, label and type columns
    #[arg(long)]
    ids_only: bool,

    /// Limit snapshot files per kind for testing (0 = no limit)
    #[arg(long, default_value = "0")]
    files_limit: usize,
}

#[derive(Args)]
struct LoaderArgs {
    /// S3 URI of the CSV to load
    #[arg(long)]
    source: String,

    #[arg(long)]
    iam_role_arn: String,

    #[arg(long)]
    region: String,

    /// Loader host, used to print the request URL
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Args)]
struct ProbeArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[arg(long, default_value = "Case")]
    label: String,

    #[arg(long, default_value_t = 10)]
    limit: i64,
}

fn parse_page_size(value: &str) -> std::result::Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("page size must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Clone, Copy)]
enum MergeKind {
    Papers,
    Refs,
}

async fn run_merge(args: &MergeArgs, kind: MergeKind, stats: &LoadStats) -> Result<()> {
    let files = find_snapshot_files(&args.fname)?;
    let conn = &args.connection;
    let session = Neo4jSession::connect(&conn.uri, &conn.user, &conn.pwd).await?;

    let target = MergeTarget {
        key: NodeKey::by_id(&args.label),
        rel_type: args.rel_type.clone(),
        page_size: args.page_size,
    };
    session.ensure_unique(&target.key).await?;
    info!(
        "Merging into {}.{} with {} records per page",
        target.key.label, target.key.property, target.page_size
    );

    for path in &files {
        info!("Loading {}", path.display());
        match kind {
            MergeKind::Papers => {
                let snapshot: NodeSnapshot = load_snapshot(path)?;
                graph::upsert_nodes(&session, &snapshot, &target, stats).await?;
            }
            MergeKind::Refs => {
                let snapshot: EdgeSnapshot = load_snapshot(path)?;
                graph::upsert_citations(&session, &snapshot, &target, stats).await?;
            }
        }
        LoadStats::add(&stats.files_processed, 1);
    }

    Ok(())
}

fn limit_files(mut files: Vec<PathBuf>, limit: usize) -> Vec<PathBuf> {
    if limit > 0 && limit < files.len() {
        files.truncate(limit);
    }
    files
}

fn run_bulk_csv(args: &BulkCsvArgs, workers: usize, stats: &LoadStats) -> Result<()> {
    let options = BulkExport {
        label: args.label.clone(),
        rel_type: args.rel_type.clone(),
        ids_only: args.ids_only,
        workers,
    };

    let node_files = limit_files(
        find_snapshot_files(&format!("{}/part_*_metadata.*", args.basedir))?,
        args.files_limit,
    );
    csv_export::export_bulk_nodes(&node_files, &args.nodes_output, &options, stats)?;

    let edge_files = limit_files(
        find_snapshot_files(&format!("{}/part_*_cite.*", args.basedir))?,
        args.files_limit,
    );
    csv_export::export_bulk_edges(&edge_files, &args.edges_output, &options, stats)?;

    info!(
        "Bulk-loader files written: {} and {}",
        args.nodes_output.display(),
        args.edges_output.display()
    );
    Ok(())
}

fn table_output(args: &TableArgs) -> PathBuf {
    args.output
        .clone()
        .unwrap_or_else(|| default_table_path(&args.fname))
}

async fn run_probe(args: &ProbeArgs) -> Result<()> {
    let conn = &args.connection;
    let session = Neo4jSession::connect(&conn.uri, &conn.user, &conn.pwd).await?;
    let (rows, elapsed) = graph::probe(&session, &args.label, args.limit).await?;
    info!("send time: {:?} ({} rows)", elapsed, rows);
    Ok(())
}

fn print_loader_request(args: &LoaderArgs) -> Result<()> {
    let request = loader::LoaderRequest::new(&args.source, &args.iam_role_arn, &args.region);
    if let Some(endpoint) = &args.endpoint {
        println!("POST {}", loader::loader_url(endpoint));
    }
    println!("{}", request.to_json()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let max_workers = num_cpus::get();
    let workers = cli.workers.unwrap_or(max_workers).max(1);
    if workers > max_workers {
        warn!("Using {} workers (max available: {})", workers, max_workers);
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("citegraph-worker-{}", i))
        .build_global()?;

    let stats = LoadStats::new();

    match &cli.command {
        Command::MergeRefs(args) => run_merge(args, MergeKind::Refs, &stats).await?,
        Command::MergePapers(args) => run_merge(args, MergeKind::Papers, &stats).await?,
        Command::NodeCsv(args) => {
            csv_export::export_node_table(&args.fname, &table_output(args), &stats)?;
        }
        Command::EdgeCsv(args) => {
            csv_export::export_citation_table(&args.fname, &table_output(args), &stats)?;
        }
        Command::BulkCsv(args) => run_bulk_csv(args, workers, &stats)?,
        Command::LoaderRequest(args) => return print_loader_request(args),
        Command::Probe(args) => return run_probe(args).await,
    }

    stats.log_summary();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn merge_defaults() {
        let cli = Cli::try_parse_from(["citegraph_loader", "merge-refs", "--fname", "part_1_graph_cite.pkl"]).unwrap();
        let Command::MergeRefs(args) = cli.command else {
            panic!("expected merge-refs");
        };
        assert_eq!(args.label, "Paper");
        assert_eq!(args.rel_type, "REF");
        assert_eq!(args.page_size, 1000);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let parsed = Cli::try_parse_from([
            "citegraph_loader",
            "merge-papers",
            "--fname",
            "x.pkl",
            "--page-size",
            "0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn table_output_defaults_next_to_input() {
        let args = TableArgs {
            fname: PathBuf::from("part_1_graph_metadata.pkl.gz"),
            output: None,
        };
        assert_eq!(table_output(&args), Path::new("part_1_graph_metadata.pkl.gz.csv"));
    }

    #[test]
    fn file_limit_truncates() {
        let files: Vec<PathBuf> = ["a", "b", "c"].iter().map(PathBuf::from).collect();
        assert_eq!(limit_files(files.clone(), 2).len(), 2);
        assert_eq!(limit_files(files, 0).len(), 3);
    }
}

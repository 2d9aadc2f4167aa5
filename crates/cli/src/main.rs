use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sluice_core::document::{encode_field_names, parse_documents};
use sluice_core::{SluiceConfig, Table, VirtualTableManifest};
use sluice_persist::{JsonStore, MemoryJsonStore, SqliteJsonStore};
use sluice_schema::{
    create_statement, parse_create_table, reconcile, AlwaysPromote, ColumnPromoter, NeverPromote,
};
use sluice_store::{
    CatalogTable, FrequencyPromoter, IngestProcessor, MemoryCatalog, Registry, TableDiscovery,
    MANIFEST_BUCKET,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sluicectl", version, about = "Sluice CLI: schema-adaptive ingestion tooling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// YAML configuration file
    #[arg(long = "config", env = "SLUICE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a CREATE TABLE statement and show the table model (`-` reads stdin)
    Parse { file: PathBuf },
    /// Parse a CREATE TABLE statement and render it back
    Render { file: PathBuf },
    /// Reconcile NDJSON documents against a table without touching any store
    Reconcile {
        #[arg(long)]
        ddl: PathBuf,
        #[arg(long)]
        doc: PathBuf,
        /// Never promote unknown fields to columns
        #[arg(long = "no-promote", action = ArgAction::SetTrue)]
        no_promote: bool,
    },
    /// Dry-run ingest of NDJSON documents; prints the statements it would execute
    Ingest {
        index: String,
        #[arg(long)]
        doc: PathBuf,
        /// JSON catalog dump (array of tables) to start from
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Run one discovery pass over a JSON catalog dump
    Discover {
        #[arg(long)]
        catalog: PathBuf,
        /// Ignore stored manifests
        #[arg(long = "no-manifests", action = ArgAction::SetTrue)]
        no_manifests: bool,
    },
    /// Manage virtual table manifests
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },
}

#[derive(Subcommand, Debug)]
enum ManifestAction {
    /// Store a manifest for an index
    Put { index: String, columns: Vec<String> },
    /// Show one manifest
    Get { index: String },
    /// List every manifest
    Ls,
}

fn init_tracing() {
    let env = std::env::var("SLUICE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SLUICE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SLUICE_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SluiceConfig> {
    let Some(path) = path else { return Ok(SluiceConfig::default()) };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg: SluiceConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate().with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_table(path: &Path) -> Result<Table> {
    let ddl = read_input(path)?;
    parse_create_table(&ddl).map_err(|e| anyhow!("{}: {e}", path.display()))
}

fn read_catalog(path: &Path) -> Result<Vec<CatalogTable>> {
    let text = read_input(path)?;
    serde_json::from_str(&text).with_context(|| format!("parsing catalog {}", path.display()))
}

#[derive(Serialize)]
struct ColumnView<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    ty: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    modifiers: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    comment: &'a str,
}

#[derive(Serialize)]
struct TableView<'a> {
    name: &'a str,
    database: &'a str,
    #[serde(rename = "virtual")]
    is_virtual: bool,
    timestamp_field: Option<&'a str>,
    columns: Vec<ColumnView<'a>>,
    config: &'a sluice_core::TableConfig,
    indexes: &'a [String],
}

impl<'a> TableView<'a> {
    fn of(t: &'a Table) -> Self {
        let columns = t
            .columns
            .values()
            .map(|c| ColumnView {
                name: &c.name,
                ty: c.ty.to_string(),
                modifiers: &c.modifiers,
                comment: &c.comment,
            })
            .collect();
        Self {
            name: &t.name,
            database: &t.database,
            is_virtual: t.is_virtual,
            timestamp_field: t.timestamp_field.as_deref(),
            columns,
            config: &t.config,
            indexes: &t.indexes,
        }
    }
}

fn print_table(t: &Table) {
    let kind = if t.is_virtual { "virtual" } else { "table" };
    let engine = if t.config.engine.is_empty() { "-" } else { t.config.engine.as_str() };
    println!("{} • {} • {} columns • engine {}", t.name, kind, t.columns.len(), engine);
    for c in t.columns.values() {
        println!("  {:<32} {}", c.name, c.ty);
    }
}

fn manifest_store() -> Result<SqliteJsonStore> {
    SqliteJsonStore::open_default().context("opening manifest store")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse { file } => {
            let table = read_table(&file)?;
            match cli.output {
                Output::Human => print_table(&table),
                Output::Json => println!("{}", serde_json::to_string_pretty(&TableView::of(&table))?),
            }
        }
        Commands::Render { file } => {
            let table = read_table(&file)?;
            println!("{}", create_statement(&table));
        }
        Commands::Reconcile { ddl, doc, no_promote } => {
            let mut table = read_table(&ddl)?;
            let promoter: Box<dyn ColumnPromoter> =
                if no_promote { Box::new(NeverPromote) } else { Box::new(AlwaysPromote) };
            let docs = parse_documents(&read_input(&doc)?).context("parsing documents")?;
            info!(table = %table.name, docs = docs.len(), "reconcile invoked");
            for d in docs {
                let out = reconcile(&table, encode_field_names(d), promoter.as_ref())?;
                match cli.output {
                    Output::Human => {
                        for stmt in &out.alter_statements {
                            println!("{stmt}");
                        }
                        println!("{}", serde_json::Value::Object(out.row.clone()));
                        if !out.dropped.is_empty() {
                            println!("-- dropped {}", serde_json::Value::Object(out.dropped.clone()));
                        }
                    }
                    Output::Json => println!(
                        "{}",
                        serde_json::json!({
                            "alter": out.alter_statements,
                            "row": out.row,
                            "dropped": out.dropped,
                        })
                    ),
                }
                table = table.with_columns(out.new_columns);
            }
        }
        Commands::Ingest { index, doc, catalog } => {
            let tables = match catalog {
                Some(path) => read_catalog(&path)?,
                None => Vec::new(),
            };
            let store = Arc::new(MemoryCatalog::with_tables(config.database.clone(), tables));
            let registry = Registry::new();
            let manifests: Arc<dyn JsonStore> = Arc::new(MemoryJsonStore::new());
            TableDiscovery::new(store.clone(), registry.clone(), config.clone(), manifests.clone())
                .reload()
                .await?;
            let promoter = Arc::new(FrequencyPromoter::new());
            let processor =
                IngestProcessor::new(store.clone(), registry, config, manifests, promoter);
            let docs = parse_documents(&read_input(&doc)?).context("parsing documents")?;
            let report = processor.ingest(&index, docs).await?;
            match cli.output {
                Output::Human => {
                    for stmt in store.executed() {
                        println!("{stmt};");
                    }
                    eprintln!(
                        "{} • {} rows • created {} • {} alters • {} dropped",
                        report.table, report.rows, report.created, report.alters, report.dropped
                    );
                }
                Output::Json => println!(
                    "{}",
                    serde_json::json!({
                        "table": report.table,
                        "rows": report.rows,
                        "created": report.created,
                        "alters": report.alters,
                        "dropped": report.dropped,
                        "statements": store.executed(),
                    })
                ),
            }
        }
        Commands::Discover { catalog, no_manifests } => {
            let tables = read_catalog(&catalog)?;
            let store = Arc::new(MemoryCatalog::with_tables(config.database.clone(), tables));
            let manifests: Arc<dyn JsonStore> =
                if no_manifests { Arc::new(MemoryJsonStore::new()) } else { Arc::new(manifest_store()?) };
            let discovery = TableDiscovery::new(store, Registry::new(), config, manifests);
            discovery.reload().await?;
            let snap = discovery.registry().current();
            match cli.output {
                Output::Human => snap.tables().for_each(|t| print_table(t)),
                Output::Json => {
                    let views: Vec<_> = snap.tables().map(|t| TableView::of(t)).collect();
                    println!("{}", serde_json::to_string_pretty(&views)?);
                }
            }
        }
        Commands::Manifest { action } => {
            let store = manifest_store()?;
            match action {
                ManifestAction::Put { index, columns } => {
                    let manifest = VirtualTableManifest::new(columns);
                    store.put(MANIFEST_BUCKET, &index, &serde_json::to_value(&manifest)?)?;
                    info!(index = %index, columns = manifest.columns.len(), "manifest stored");
                }
                ManifestAction::Get { index } => match store.get(MANIFEST_BUCKET, &index)? {
                    Some(v) => println!("{}", serde_json::to_string_pretty(&v)?),
                    None => return Err(anyhow!("no manifest for {index}")),
                },
                ManifestAction::Ls => {
                    let all = store.list(MANIFEST_BUCKET)?;
                    match cli.output {
                        Output::Human => {
                            for (index, v) in all {
                                let version = v.get("version").and_then(|v| v.as_str()).unwrap_or("-");
                                let n = v
                                    .get("columns")
                                    .and_then(|c| c.as_array())
                                    .map(|c| c.len())
                                    .unwrap_or(0);
                                println!("{index} • {version} • {n} columns");
                            }
                        }
                        Output::Json => {
                            let map: serde_json::Map<String, serde_json::Value> = all.into_iter().collect();
                            println!("{}", serde_json::to_string_pretty(&map)?);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

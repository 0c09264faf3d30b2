use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tally_sync::db::table_counts;
use tally_sync::export::{export_table, export_to_path};
use tally_sync::parser::{detect_format, get_parser, PayloadFormat};
use tally_sync::{
    logging, setup_database, BatchImporter, Collection, DirectorySource, EdgeFunctionSink,
    HttpTransport, ImportOperation, ProxySource, ReconciliationEngine, Schema, Sink, SqliteSink,
    SyncConfig, SyncOptions, SyncRunner, TallyServerSource, TallySource, TallyTable,
};

#[derive(Parser, Debug)]
#[command(name = "tally-sync", author, version, about = "Mirror Tally accounting data into a multi-tenant database", long_about = None)]
struct Cli {
    /// JSON config file (TALLY_SYNC_* variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true)]
    company_id: Option<String>,

    #[arg(long, global = true)]
    division_id: Option<String>,

    /// -v debug, -vv trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create every table in every namespace
    Init,
    /// Fetch, parse and import collections
    Sync(SyncArgs),
    /// Parse a Tally XML/JSON file and print the records as JSON
    Parse {
        file: PathBuf,
        #[arg(long)]
        collection: Collection,
    },
    /// Compare two namespaces and optionally copy the differences
    Reconcile {
        #[arg(long, default_value = "backup")]
        source: Schema,
        #[arg(long, default_value = "vt")]
        target: Schema,
        /// Only this table (default: all)
        #[arg(long)]
        table: Option<TallyTable>,
        /// Copy missing and changed rows into the target
        #[arg(long)]
        apply: bool,
        /// With --apply, delete target rows the source doesn't have
        #[arg(long, requires = "apply")]
        prune: bool,
    },
    /// Check that ledger balances net to zero
    TrialBalance {
        #[arg(long)]
        schema: Option<Schema>,
    },
    /// Write one table to CSV
    Export {
        #[arg(long)]
        table: TallyTable,
        #[arg(long)]
        schema: Option<Schema>,
        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Row counts per namespace and table
    Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SourceKind {
    /// Tally's XML endpoint
    Tally,
    /// JSON proxy in front of Tally
    Proxy,
    /// <slug>.xml / <slug>.json files
    Dir,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SinkKind {
    /// Local SQLite database
    Local,
    /// tally-bulk-import edge function
    Edge,
}

#[derive(Args, Debug)]
struct SyncArgs {
    #[arg(long, value_enum, default_value = "tally")]
    source: SourceKind,

    #[arg(long, value_enum, default_value = "local")]
    sink: SinkKind,

    /// Fixture directory for --source dir
    #[arg(long)]
    dir: Option<PathBuf>,

    #[arg(long)]
    tally_url: Option<String>,

    #[arg(long)]
    proxy_url: Option<String>,

    #[arg(long)]
    edge_url: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    /// Tally company name
    #[arg(long)]
    company: Option<String>,

    /// Comma-separated collections (default: all, in dependency order)
    #[arg(long, value_delimiter = ',')]
    collections: Vec<Collection>,

    #[arg(long, default_value = "upsert")]
    operation: ImportOperation,

    /// Namespace for the local sink
    #[arg(long)]
    schema: Option<Schema>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Voucher period start (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Voucher period end (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Parse and check without writing
    #[arg(long)]
    dry_run: bool,

    /// Print the report as JSON instead of a summary
    #[arg(long)]
    json: bool,

    /// Exit non-zero when any table fails
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(company_id) = &cli.company_id {
        config.company_id = company_id.clone();
    }
    if let Some(division_id) = &cli.division_id {
        config.division_id = division_id.clone();
    }

    match cli.command {
        Command::Init => run_init(&config),
        Command::Sync(args) => run_sync(config, args),
        Command::Parse { file, collection } => run_parse(&file, collection),
        Command::Reconcile {
            source,
            target,
            table,
            apply,
            prune,
        } => run_reconcile(&config, source, target, table, apply, prune),
        Command::TrialBalance { schema } => run_trial_balance(&config, schema),
        Command::Export {
            table,
            schema,
            output,
        } => run_export(&config, table, schema, output.as_deref()),
        Command::Stats => run_stats(&config),
    }
}

fn open_database(config: &SyncConfig) -> Result<Connection> {
    let conn = Connection::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_init(config: &SyncConfig) -> Result<()> {
    open_database(config)?;
    println!("✓ Database initialized at {} (WAL mode)", config.db_path.display());
    println!(
        "  {} tables × {} namespaces ({})",
        TallyTable::ALL.len(),
        Schema::ALL.len(),
        Schema::ALL.map(|s| s.name()).join(", ")
    );
    Ok(())
}

fn run_sync(mut config: SyncConfig, args: SyncArgs) -> Result<()> {
    let overrides = [
        (&mut config.tally_url, args.tally_url),
        (&mut config.proxy_url, args.proxy_url),
        (&mut config.edge_function_url, args.edge_url),
        (&mut config.api_key, args.api_key),
        (&mut config.company_name, args.company),
    ];
    for (slot, value) in overrides {
        if value.is_some() {
            *slot = value;
        }
    }
    if let Some(schema) = args.schema {
        config.schema = schema;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;

    let retry = config.retry_policy();
    let source: Box<dyn TallySource> = match args.source {
        SourceKind::Tally => {
            let Some(url) = config.tally_url.clone() else {
                bail!("--source tally needs --tally-url or TALLY_SYNC_TALLY_URL");
            };
            Box::new(
                TallyServerSource::new(HttpTransport::new(config.timeout())?, url, retry)
                    .with_company(config.company_name.clone())
                    .with_period(args.from, args.to),
            )
        }
        SourceKind::Proxy => {
            let Some(url) = config.proxy_url.clone() else {
                bail!("--source proxy needs --proxy-url or TALLY_SYNC_PROXY_URL");
            };
            let company = config.company_name.clone().unwrap_or_default();
            Box::new(ProxySource::new(HttpTransport::new(config.timeout())?, url, company, retry))
        }
        SourceKind::Dir => {
            let Some(dir) = args.dir.clone() else {
                bail!("--source dir needs --dir");
            };
            Box::new(DirectorySource::new(dir))
        }
    };

    // Kept alive for the local sink's borrow
    let conn;
    let sink: Box<dyn Sink + '_> = match args.sink {
        SinkKind::Local => {
            conn = open_database(&config)?;
            Box::new(SqliteSink::new(&conn, config.schema))
        }
        SinkKind::Edge => {
            let Some(url) = config.edge_function_url.clone() else {
                bail!("--sink edge needs --edge-url or TALLY_SYNC_EDGE_FUNCTION_URL");
            };
            let api_key = config.api_key.clone().unwrap_or_default();
            Box::new(EdgeFunctionSink::new(HttpTransport::new(config.timeout())?, url, api_key))
        }
    };

    let options = SyncOptions {
        collections: if args.collections.is_empty() {
            Collection::ALL.to_vec()
        } else {
            args.collections.clone()
        },
        operation: args.operation,
        dry_run: args.dry_run,
    };

    let importer = BatchImporter::new(config.batch_size, retry);
    let report = SyncRunner::new(source.as_ref(), sink.as_ref(), config.tenant(), importer).run(&options);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }

    report.check(args.strict)
}

fn run_parse(file: &Path, collection: Collection) -> Result<()> {
    let body = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let format = detect_format(&body).unwrap_or(PayloadFormat::Xml);

    let outcome = get_parser(format).parse(&body, collection)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    eprintln!(
        "✓ {} {} parsed, {} skipped",
        outcome.records.len(),
        collection,
        outcome.skipped.len()
    );
    Ok(())
}

fn run_reconcile(
    config: &SyncConfig,
    source: Schema,
    target: Schema,
    table: Option<TallyTable>,
    apply: bool,
    prune: bool,
) -> Result<()> {
    config.validate()?;
    if source == target {
        bail!("source and target namespaces are the same ({})", source);
    }

    let conn = open_database(config)?;
    let tenant = config.tenant();
    let engine = ReconciliationEngine::new();

    let diffs = match table {
        Some(table) => vec![engine.reconcile_table(&conn, source, target, table, &tenant)?],
        None => engine.reconcile_all(&conn, source, target, &tenant)?,
    };

    for diff in &diffs {
        let marker = if diff.is_in_sync() { "✅" } else { "⚠️ " };
        println!("{} {}", marker, diff.summary());

        if apply && !diff.is_in_sync() {
            let stats = engine.apply(&conn, diff, &tenant, prune)?;
            println!(
                "   → {} inserted, {} updated, {} pruned",
                stats.inserted, stats.updated, stats.pruned
            );
        }
    }
    Ok(())
}

fn run_trial_balance(config: &SyncConfig, schema: Option<Schema>) -> Result<()> {
    config.validate()?;
    let conn = open_database(config)?;
    let balance = ReconciliationEngine::new().trial_balance(&conn, schema.unwrap_or(config.schema), &config.tenant())?;

    let marker = if balance.result.is_balanced() { "✅" } else { "❌" };
    println!("{} {}", marker, balance.summary());
    Ok(())
}

fn run_export(config: &SyncConfig, table: TallyTable, schema: Option<Schema>, output: Option<&Path>) -> Result<()> {
    config.validate()?;
    let conn = open_database(config)?;
    let schema = schema.unwrap_or(config.schema);
    let tenant = config.tenant();

    match output {
        Some(path) => {
            let count = export_to_path(&conn, schema, table, &tenant, path)?;
            eprintln!("✓ {} rows written to {}", count, path.display());
        }
        None => {
            export_table(&conn, schema, table, &tenant, io::stdout().lock())?;
        }
    }
    Ok(())
}

fn run_stats(config: &SyncConfig) -> Result<()> {
    config.validate()?;
    let conn = open_database(config)?;

    println!("📊 {} / {}", config.company_id, config.division_id);
    for count in table_counts(&conn, &config.tenant())? {
        if count.rows > 0 {
            println!("  {:<28} {:>8}", count.table.qualified(count.schema), count.rows);
        }
    }
    Ok(())
}

//! CLI tool for inspecting and maintaining a tickstore root.

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arrow::compute::concat_batches;
use clap::{Parser, Subcommand};
use log::info;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;
use snafu::ResultExt;
use tickstore_core::{
    calendar::StaticCalendar,
    config::StoreConfig,
    date::{DateRange, TradeDate},
    layout,
    lock::LockTarget,
    scan::CoverageMap,
    store::Store,
    writer::PartitionOutcome,
};
use tracing_subscriber::EnvFilter;

use crate::error::{
    CliResult, CombineBatchesSnafu, ConfigExistsSnafu, IncompleteWriteSnafu, InvalidDateSnafu,
    ParquetMissingSnafu, ParseCalendarSnafu, ReadCalendarSnafu, ReadParquetSnafu,
    RegistrySnafu, RenderSnafu, StoreSnafu, WriteConfigSnafu,
};

#[derive(Debug, Subcommand)]
enum RegistryCommand {
    /// Resolve codes to IDs, allocating new IDs for unseen codes
    Resolve {
        #[arg(long, default_value = "instrument")]
        namespace: String,

        codes: Vec<String>,
    },

    /// Look up the code of an ID
    Lookup {
        #[arg(long, default_value = "instrument")]
        namespace: String,

        id: u32,
    },

    /// Print every code and ID of a namespace
    List {
        #[arg(long, default_value = "instrument")]
        namespace: String,
    },
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default configuration to <root>/tickstore.json
    InitConfig {
        #[arg(long)]
        root: PathBuf,

        /// Replace an existing configuration file
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// List configured data types
    DataTypes {
        #[arg(long)]
        root: PathBuf,
    },

    /// Report stored coverage of a data type
    Scan {
        #[arg(long)]
        root: PathBuf,

        #[arg(long = "data-type")]
        data_type: String,

        /// Trading calendar file (one YYYYMMDD date per line) for gap detection
        #[arg(long)]
        calendar: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the fetches needed to cover a date range
    Plan {
        #[arg(long)]
        root: PathBuf,

        #[arg(long = "data-type")]
        data_type: String,

        /// First date, YYYYMMDD or YYYY-MM-DD
        #[arg(long)]
        start: String,

        /// Last date (inclusive), YYYYMMDD or YYYY-MM-DD
        #[arg(long)]
        end: String,

        #[arg(long)]
        calendar: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Merge the rows of a Parquet file into a data type
    Ingest {
        #[arg(long)]
        root: PathBuf,

        #[arg(long = "data-type")]
        data_type: String,

        #[arg(long)]
        parquet: PathBuf,

        /// Print elapsed time for the write
        #[arg(long, default_value_t = false)]
        timing: bool,
    },

    /// Run a compaction pass over a data type
    Compact {
        #[arg(long)]
        root: PathBuf,

        #[arg(long = "data-type")]
        data_type: String,
    },

    /// Inspect or extend an identifier registry
    Registry {
        #[arg(long)]
        root: PathBuf,

        #[command(subcommand)]
        cmd: RegistryCommand,
    },
}

#[derive(Debug, Parser)]
#[command(name = "tickstore", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

fn parse_date(value: &str) -> CliResult<TradeDate> {
    value.parse::<TradeDate>().context(InvalidDateSnafu {
        value: value.to_string(),
    })
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value).context(RenderSnafu)?;
    println!("{text}");
    Ok(())
}

async fn open_store(root: &Path, calendar: Option<&Path>) -> CliResult<Store> {
    let store = Store::open(root).await.context(StoreSnafu)?;
    let Some(path) = calendar else {
        return Ok(store);
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .context(ReadCalendarSnafu {
            path: path.display().to_string(),
        })?;
    let calendar = StaticCalendar::parse_lines(&text).context(ParseCalendarSnafu {
        path: path.display().to_string(),
    })?;
    info!("loaded {} calendar dates from {}", calendar.len(), path.display());
    Ok(store.with_calendar(Arc::new(calendar)))
}

async fn cmd_init_config(root: &Path, force: bool) -> CliResult<()> {
    let path = root.join(layout::config_rel_path());
    let display = path.display().to_string();
    if path.exists() && !force {
        return ConfigExistsSnafu { path: display }.fail();
    }
    let text = StoreConfig::default()
        .to_json_pretty()
        .context(RenderSnafu)?;
    tokio::fs::create_dir_all(root)
        .await
        .context(WriteConfigSnafu {
            path: root.display().to_string(),
        })?;
    tokio::fs::write(&path, text)
        .await
        .context(WriteConfigSnafu {
            path: display.clone(),
        })?;
    println!("Wrote {display}");
    Ok(())
}

async fn cmd_data_types(root: &Path) -> CliResult<()> {
    let store = open_store(root, None).await?;
    let mut rows: Vec<_> = store.config().data_types.iter().collect();
    rows.sort_by(|a, b| (a.1.priority, a.0).cmp(&(b.1.priority, b.0)));
    for (name, cfg) in rows {
        println!(
            "{name:<14} priority={:<4} date={:<12} entity={:<10} partitions={}",
            cfg.priority,
            cfg.date_column,
            cfg.entity_column.as_deref().unwrap_or("-"),
            cfg.granularity
        );
    }
    Ok(())
}

fn print_coverage(map: &CoverageMap) {
    println!(
        "{}: {:?}, {} partition(s), {} row(s), gap detection {}",
        map.data_type,
        map.status,
        map.partitions,
        map.rows,
        if map.gap_detection { "on" } else { "off" }
    );
    for (subject, record) in &map.subjects {
        let gaps: Vec<String> = record
            .gaps
            .iter()
            .map(|g| format!("{}..={}", g.start, g.end))
            .collect();
        println!(
            "  {subject:<8} {}..={} dates={} gaps=[{}]",
            record.first,
            record.last,
            record.covered_dates,
            gaps.join(", ")
        );
    }
    for bad in &map.unreadable {
        println!("  unreadable {}: {}", bad.path, bad.reason);
    }
}

async fn cmd_scan(root: &Path, data_type: &str, calendar: Option<&Path>, json: bool) -> CliResult<()> {
    let store = open_store(root, calendar).await?;
    let map = store.scan(data_type).await.context(StoreSnafu)?;
    if json {
        print_json(&map)
    } else {
        print_coverage(&map);
        Ok(())
    }
}

async fn cmd_plan(
    root: &Path,
    data_type: &str,
    range: DateRange,
    calendar: Option<&Path>,
    json: bool,
) -> CliResult<()> {
    let store = open_store(root, calendar).await?;
    let items = store
        .decide(data_type, range, None)
        .await
        .context(StoreSnafu)?;
    if json {
        return print_json(&items);
    }
    if items.is_empty() {
        println!("{data_type}: nothing to fetch for {}..={}", range.start, range.end);
    }
    for item in &items {
        println!(
            "{} {:<8} {}..={} {:?} ({})",
            item.data_type, item.target, item.range.start, item.range.end, item.strategy, item.reason
        );
    }
    Ok(())
}

async fn cmd_ingest(root: &Path, data_type: &str, parquet: &Path, timing: bool) -> CliResult<()> {
    let path = parquet.display().to_string();
    let file = std::fs::File::open(parquet).context(ParquetMissingSnafu { path: path.clone() })?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context(ReadParquetSnafu { path: path.clone() })?;
    let schema = builder.schema().clone();
    let reader = builder.build().context(ReadParquetSnafu { path: path.clone() })?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.context(CombineBatchesSnafu { path: path.clone() })?);
    }
    let batch = concat_batches(&schema, &batches).context(CombineBatchesSnafu { path: path.clone() })?;

    let store = open_store(root, None).await?;
    let start = Instant::now();
    let lease = store
        .acquire_with_wait(data_type, LockTarget::All)
        .await
        .context(StoreSnafu)?;
    let result = store.write(data_type, &lease, &batch).await;
    store.release(lease).context(StoreSnafu)?;
    let report = result.context(StoreSnafu)?;
    let elapsed = start.elapsed();

    for part in &report.partitions {
        let name = part
            .partition
            .map_or_else(|| "unassigned".to_string(), |k| k.to_string());
        match &part.outcome {
            PartitionOutcome::Written { rows_after, bytes } => {
                println!("{name}: +{} rows, {rows_after} stored, {bytes} bytes", part.rows)
            }
            PartitionOutcome::Rejected(e) | PartitionOutcome::Failed(e) => {
                println!("{name}: {} rows not written: {e}", part.rows)
            }
        }
    }
    if let Some(compaction) = &report.compaction {
        match compaction {
            Ok(c) if !c.is_noop() => println!(
                "compaction: {} merged, {} split, {} stale removed",
                c.merged.len(),
                c.split.len(),
                c.removed_stale.len()
            ),
            Ok(_) => {}
            Err(e) => println!("compaction failed: {e}"),
        }
    }
    if timing {
        println!("Elapsed: {:.3} ms", elapsed.as_secs_f64() * 1000.0);
    }

    let problems = report.problems().count();
    if problems > 0 {
        return IncompleteWriteSnafu {
            data_type: data_type.to_string(),
            problems,
        }
        .fail();
    }
    Ok(())
}

async fn cmd_compact(root: &Path, data_type: &str) -> CliResult<()> {
    let store = open_store(root, None).await?;
    let report = store.compact(data_type).await.context(StoreSnafu)?;
    for key in &report.removed_stale {
        println!("removed stale {key}");
    }
    for step in &report.split {
        println!("split {} into {} partition(s)", step.span, step.into.len());
    }
    for step in &report.merged {
        println!("merged {} partition(s) into {}", step.sources.len(), step.into);
    }
    for step in &report.skipped {
        println!("skipped {:?}: {}", step.partitions, step.reason);
    }
    if report.is_noop() && report.skipped.is_empty() {
        println!("{data_type}: nothing to compact");
    }
    Ok(())
}

async fn cmd_registry(root: &Path, cmd: RegistryCommand) -> CliResult<()> {
    let store = open_store(root, None).await?;
    match cmd {
        RegistryCommand::Resolve { namespace, codes } => {
            let registry = store.registry(&namespace).await.context(StoreSnafu)?;
            let ids = registry.resolve_many(&codes).await.context(RegistrySnafu)?;
            for (code, id) in codes.iter().zip(ids) {
                println!("{id}\t{code}");
            }
        }
        RegistryCommand::Lookup { namespace, id } => {
            let registry = store.registry(&namespace).await.context(StoreSnafu)?;
            let code = registry.lookup_code(id).await.context(RegistrySnafu)?;
            println!("{id}\t{code}");
        }
        RegistryCommand::List { namespace } => {
            let registry = store.registry(&namespace).await.context(StoreSnafu)?;
            for (id, code) in registry.entries().await {
                println!("{id}\t{code}");
            }
        }
    }
    Ok(())
}

async fn run() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::InitConfig { root, force } => cmd_init_config(&root, force).await,
        Command::DataTypes { root } => cmd_data_types(&root).await,
        Command::Scan {
            root,
            data_type,
            calendar,
            json,
        } => cmd_scan(&root, &data_type, calendar.as_deref(), json).await,
        Command::Plan {
            root,
            data_type,
            start,
            end,
            calendar,
            json,
        } => {
            let range = DateRange::new(parse_date(&start)?, parse_date(&end)?);
            cmd_plan(&root, &data_type, range, calendar.as_deref(), json).await
        }
        Command::Ingest {
            root,
            data_type,
            parquet,
            timing,
        } => cmd_ingest(&root, &data_type, &parquet, timing).await,
        Command::Compact { root, data_type } => cmd_compact(&root, &data_type).await,
        Command::Registry { root, cmd } => cmd_registry(&root, cmd).await,
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

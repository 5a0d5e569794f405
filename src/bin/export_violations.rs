//! export_violations - dump violation records for a date range as CSV or JSON

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};

use zone_sentinel::storage::DateRange;
use zone_sentinel::{SqliteViolationStore, ViolationStore};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Csv,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the violation database.
    #[arg(long, env = "SENTINEL_DB_PATH", default_value = "data/database.db")]
    db_path: String,
    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,
    /// Inclusive lower bound (ISO date or timestamp).
    #[arg(long)]
    start: Option<String>,
    /// Inclusive upper bound (ISO date or timestamp); a bare date covers the whole day.
    #[arg(long)]
    end: Option<String>,
    /// Output file; stdout when omitted.
    #[arg(long)]
    output: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !std::path::Path::new(&args.db_path).exists() {
        return Err(anyhow!("database {} does not exist", args.db_path));
    }
    let store = SqliteViolationStore::open(&args.db_path)?;
    let range = DateRange::parse(args.start.as_deref(), args.end.as_deref())?;

    let body = match args.format {
        Format::Csv => store.export_csv(&range)?,
        Format::Json => store.export_json(&range)?,
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &body).with_context(|| format!("failed to write {}", path))?;
            log::info!("export written to {}", path);
        }
        None => print!("{}", body),
    }
    Ok(())
}

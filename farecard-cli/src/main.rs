//! farecard: Decode transit-fare card dumps from the command line.
//!
//! Supports:
//! - Identifying the card family of a dump
//! - Decoding balance, trips and subscriptions (table or JSON)
//! - Listing raw records and per-file decoded fields
//! - Date-shifting output for sharing

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use farecard_core::{
    decode, family, obfuscate, CardDump, DecodedFieldMap, NoStations, RecordContent,
    StationResolver, TransitData,
};

mod config;
mod dump;

use config::{Config, OutputFormat};

#[derive(Parser)]
#[command(name = "farecard", version, about = "Transit-fare card dump decoder")]
struct Cli {
    /// Config file
    #[arg(long, global = true, env = "FARECARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `farecard_core=trace` (overrides RUST_LOG and config)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the card family and serial number
    Identify {
        /// Dump file (MIFARE Classic Tool text or selector lines)
        file: PathBuf,
    },
    /// Decode balance, trips and subscriptions
    Decode {
        file: PathBuf,

        /// Print JSON instead of tables
        #[arg(long)]
        json: bool,

        /// Move every date by this many days
        #[arg(long, allow_hyphen_values = true)]
        shift_days: Option<i64>,

        /// Station names, one `agency,id,name` per line
        #[arg(long)]
        stations: Option<PathBuf>,
    },
    /// List every record in the dump
    Records { file: PathBuf },
    /// Decode each file of the identified family field by field
    Fields {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config {
        /// Write a default config file
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::config_file);
    let config = config::load_config_from(&config_path);
    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
    debug!(path = %config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Identify { file } => cmd_identify(&file),
        Commands::Decode {
            file,
            json,
            shift_days,
            stations,
        } => cmd_decode(&file, &config, json, shift_days, stations.as_deref()),
        Commands::Records { file } => cmd_records(&file),
        Commands::Fields { file, json } => cmd_fields(&file, &config, json),
        Commands::Config { init, force } => cmd_config(&config_path, &config, init, force),
    }
}

/// `RUST_LOG` wins over `level` when set.
fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

fn open(file: &Path) -> CardDump {
    match dump::load_dump(file) {
        Ok(d) => {
            info!(file = %file.display(), records = d.len(), "dump loaded");
            d
        }
        Err(e) => fail(e),
    }
}

fn use_json(config: &Config, flag: bool) -> bool {
    flag || config.output.format == OutputFormat::Json
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_identify(file: &Path) {
    let card = open(file);
    match family::parse_identity(&card) {
        Ok(id) => println!("{}  {}", id.name, id.serial.as_deref().unwrap_or("-")),
        Err(e) => fail(e),
    }
}

fn cmd_decode(
    file: &Path,
    config: &Config,
    json: bool,
    shift_days: Option<i64>,
    stations: Option<&Path>,
) {
    let card = open(file);
    let resolver: Box<dyn StationResolver> = match stations {
        Some(path) => match dump::load_stations(path) {
            Ok(table) => Box::new(table),
            Err(e) => fail(e),
        },
        None => Box::new(NoStations),
    };

    let mut data = match family::parse(&card, resolver.as_ref()) {
        Ok(d) => d,
        Err(e) => fail(e),
    };

    let days = shift_days.unwrap_or(config.privacy.shift_days);
    if days != 0 {
        data = match obfuscate::shift_transit_data(data, days) {
            Ok(d) => d,
            Err(e) => fail(e),
        };
    }

    if use_json(config, json) {
        print_json(&data);
    } else {
        print_transit_data(&data);
    }
}

fn cmd_records(file: &Path) {
    let card = open(file);

    let mut table = Table::new();
    table.set_header(vec!["Selector", "State", "Bytes", "Data"]);
    for record in card.records() {
        let (state, len, hex) = match &record.content {
            RecordContent::Data(data) => ("data", data.len().to_string(), data.hex()),
            RecordContent::Unauthorized => ("unauthorized", "-".into(), String::new()),
            RecordContent::Absent => ("absent", "-".into(), String::new()),
        };
        table.add_row(vec![
            Cell::new(&record.selector),
            Cell::new(state),
            Cell::new(len),
            Cell::new(hex),
        ]);
    }
    println!("{table}");
    println!("\n{} records", card.len());
}

#[derive(Debug, Serialize)]
struct FileFields {
    selector: String,
    label: &'static str,
    fields: Option<DecodedFieldMap>,
    error: Option<String>,
}

/// Decode every file the identified family knows about with its layout.
fn decode_files(card: &CardDump) -> farecard_core::Result<(&'static str, Vec<FileFields>)> {
    use farecard_core::Card;

    let fam = family::identify(card)?;
    let files = fam
        .files()
        .into_iter()
        .filter_map(|spec| {
            let record = card.read(&spec.selector);
            if matches!(record.content, RecordContent::Absent) {
                return None;
            }
            let decoded = record.data().and_then(|data| decode(spec.schema, data));
            let (fields, error) = match decoded {
                Ok(map) => (Some(map), None),
                Err(e) => (None, Some(e.to_string())),
            };
            Some(FileFields {
                selector: spec.selector.to_string(),
                label: spec.label,
                fields,
                error,
            })
        })
        .collect();
    Ok((fam.name(), files))
}

fn cmd_fields(file: &Path, config: &Config, json: bool) {
    let card = open(file);
    let (name, files) = match decode_files(&card) {
        Ok(r) => r,
        Err(e) => fail(e),
    };

    if use_json(config, json) {
        print_json(&files);
        return;
    }

    println!("{name}");
    for file in &files {
        println!("\n{} ({})", file.selector, file.label);
        if let Some(error) = &file.error {
            println!("  ! {error}");
        }
        let Some(fields) = &file.fields else {
            continue;
        };
        let mut table = Table::new();
        table.set_header(vec!["Field", "Value", "Raw"]);
        for (field, value) in fields.iter() {
            let raw = value.raw().map(|r| format!("{r:#x}")).unwrap_or_default();
            let field = if value.is_unknown() {
                format!("{field} (?)")
            } else {
                field.to_string()
            };
            table.add_row(vec![Cell::new(field), Cell::new(value), Cell::new(raw)]);
        }
        println!("{table}");
    }
}

fn cmd_config(path: &Path, config: &Config, init: bool, force: bool) {
    if init {
        if path.exists() && !force {
            fail(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            ));
        }
        if let Err(e) = config::save_config_to(&Config::default(), path) {
            fail(format!("writing {}: {e}", path.display()));
        }
        println!("Wrote {}", path.display());
        return;
    }

    println!("Config file: {}", path.display());
    println!("  output.format:      {}", config.output.format);
    println!("  privacy.shift_days: {}", config.privacy.shift_days);
    println!("  logging.level:      {}", config.logging.level);
}

// ---------------------------------------------------------------------------
// Table output
// ---------------------------------------------------------------------------

fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".into())
}

fn print_transit_data(data: &TransitData) {
    println!("Card:     {}", data.name);
    println!("Serial:   {}", data.serial.as_deref().unwrap_or("-"));
    println!("Balance:  {}", opt(&data.balance));
    for (key, value) in &data.info {
        println!("{:<9} {value}", format!("{key}:"));
    }

    if !data.trips.is_empty() {
        let mut table = Table::new();
        table.set_header(vec![
            "Start", "End", "Kind", "Mode", "Route", "From", "To", "Fare",
        ]);
        for trip in &data.trips {
            table.add_row(vec![
                Cell::new(opt(&trip.start)),
                Cell::new(opt(&trip.end)),
                Cell::new(format!("{:?}", trip.kind)),
                Cell::new(trip.mode),
                Cell::new(trip.route.as_deref().unwrap_or("-")),
                Cell::new(opt(&trip.origin)),
                Cell::new(opt(&trip.destination)),
                Cell::new(opt(&trip.fare)),
            ]);
        }
        println!("\n{table}");
        println!("{} trips", data.trips.len());
    }

    if !data.subscriptions.is_empty() {
        let mut table = Table::new();
        table.set_header(vec![
            "Id", "Agency", "Tariff", "Valid from", "Valid to", "Trips left", "Balance",
        ]);
        for sub in &data.subscriptions {
            table.add_row(vec![
                Cell::new(sub.id),
                Cell::new(opt(&sub.agency)),
                Cell::new(opt(&sub.tariff)),
                Cell::new(opt(&sub.valid_from)),
                Cell::new(opt(&sub.valid_to)),
                Cell::new(opt(&sub.remaining_trips)),
                Cell::new(opt(&sub.balance)),
            ]);
        }
        println!("\n{table}");
    }

    if !data.faults.is_empty() {
        eprintln!("\n{} records could not be decoded:", data.faults.len());
        for fault in &data.faults {
            eprintln!("  {} (slot {}): {}", fault.selector, fault.slot, fault.error);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

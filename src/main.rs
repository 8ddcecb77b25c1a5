//! default-key CLI
//!
//! Builds a mapping from a table line against an in-memory backend and
//! reports what the target would do.
//!
//! ```text
//! default-key check  "<begin> <len> default-key <args...>"
//! default-key status "<begin> <len> default-key <args...>" [--json]
//! default-key map    "<begin> <len> default-key <args...>" --position N [--sectors N] [--op read]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use default_key::domain::{DeviceRegistry, Request, SECTOR_SIZE};
use default_key::error::ConfigError;
use default_key::inventory::Inventory;
use default_key::mock::{MockCipherEngine, MockDeviceRegistry};
use default_key::table::TableLine;
use default_key::target::{Mapping, MappingConfig, StatusType};

// =============================================================================
// CLI Arguments
// =============================================================================

/// default-key - inline block-encryption mapping target
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML inventory of backing devices and engine capabilities
    #[arg(long, env = "DEFAULT_KEY_INVENTORY")]
    inventory: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a table line without registering the key
    Check {
        /// Full table line
        table: String,
    },

    /// Construct the mapping, print its status and tear it down
    Status {
        table: String,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,

        /// Render the INFO status instead of the table line
        #[arg(long)]
        info: bool,
    },

    /// Construct the mapping and map a single request
    Map {
        table: String,

        /// Virtual position in 512-byte sectors
        #[arg(long)]
        position: u64,

        /// Length in 512-byte sectors
        #[arg(long, default_value_t = 8)]
        sectors: u64,

        #[arg(long, value_enum, default_value_t = OpArg::Read)]
        op: OpArg,

        /// Mark the payload as already encrypted
        #[arg(long)]
        skip_encryption: bool,

        /// Also dispatch the request to the backing device
        #[arg(long)]
        submit: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OpArg {
    Read,
    Write,
    ZoneAppend,
    Discard,
    Flush,
    ZoneReset,
}

impl OpArg {
    fn request(self, position: u64, sectors: u64) -> Request {
        let payload = || vec![0u8; (sectors * u64::from(SECTOR_SIZE)) as usize];
        match self {
            OpArg::Read => Request::read(position, sectors),
            OpArg::Write => Request::write(position, payload()),
            OpArg::ZoneAppend => Request::zone_append(position, payload()),
            OpArg::Discard => Request::discard(position, sectors),
            OpArg::Flush => Request::flush(),
            OpArg::ZoneReset => Request::zone_reset(position),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match &args.command {
        Command::Check { table } => {
            let (registry, _) = backend(&args, table)?;
            check(table, &registry)
        }
        Command::Status { table, json, info } => {
            let (registry, engine) = backend(&args, table)?;
            let mapping = Mapping::construct(table, &registry, engine).await?;
            let status = mapping.status();
            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if *info {
                println!("{}", status.render(StatusType::Info));
            } else {
                println!("{}", status.render(StatusType::Table));
            }
            mapping.teardown().await?;
            Ok(())
        }
        Command::Map {
            table,
            position,
            sectors,
            op,
            skip_encryption,
            submit,
        } => {
            let (registry, engine) = backend(&args, table)?;
            let mapping = Mapping::construct(table, &registry, engine).await?;

            let mut request = op.request(*position, *sectors);
            if *skip_encryption {
                request = request.with_skip_encryption();
            }

            let outcome = if *submit {
                mapping
                    .submit(request)
                    .await
                    .map(|c| json!({ "position": c.position, "backing_position": c.backing_position, "dun": c.dun }))
                    .map_err(anyhow::Error::from)
            } else {
                mapping
                    .map(&request)
                    .map(|m| {
                        json!({
                            "op": m.op,
                            "backing_position": m.backing_position,
                            "sectors": m.sectors,
                            "dun": m.dun(),
                            "key_id": m.context.as_ref().map(|ctx| ctx.key_id().0),
                        })
                    })
                    .map_err(anyhow::Error::from)
            };

            mapping.teardown().await?;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
            Ok(())
        }
    }
}

/// Registry and engine from the inventory, or a single device sized for
/// the table line.
fn backend(args: &Args, table: &str) -> Result<(MockDeviceRegistry, Arc<MockCipherEngine>)> {
    let inventory = match &args.inventory {
        Some(path) => Inventory::load(path)?,
        None => Inventory::for_table(&TableLine::parse(table)?)?,
    };
    Ok(inventory.build())
}

fn check(table: &str, registry: &dyn DeviceRegistry) -> Result<()> {
    let line = TableLine::parse(table)?;
    let args = line.target_args()?;
    let key = args.key_material()?;
    let device = registry
        .lookup(&args.device_path)
        .ok_or_else(|| ConfigError::DeviceLookupFailed(args.device_path.clone()))?;
    let config = MappingConfig::build(key, device, args.iv_offset, args.start, line.length, args.options)
        .with_context(|| format!("invalid mapping for {}", args.device_path))?;

    info!(max_dun = config.max_dun(), "table line is valid");
    println!(
        "ok: {} sectors, sector_size {}, max_dun {}, dun_bytes {}",
        config.mapped_length(),
        config.crypto_sector_size(),
        config.max_dun(),
        config.dun_byte_width()
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

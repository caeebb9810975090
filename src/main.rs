//! Pi-Plate protocol tool
//!
//! Inspect configuration, list plate families, and drive the protocol engine
//! against a simulated plate stack.
//!
//! # Usage
//!
//! ```bash
//! # Print the active configuration
//! piplate config show --config /etc/piplate.toml
//!
//! # Write a default configuration file
//! piplate config init --output piplate.toml
//!
//! # List plate families and their address ranges
//! piplate plates list
//!
//! # Ask the TINKERplate at address 53 for its identity string
//! piplate sim exchange --addr 53 --cmd 1 --len -1
//!
//! # Same, with the first two checksums corrupted
//! piplate sim exchange --addr 53 --cmd 1 --len -1 --fault corrupt-checksum --fault-count 2
//!
//! # Hammer a plate with identity and address queries
//! piplate sim soak --addr 24 --iterations 1000 --fault-every 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use piplate_spi::plates::{
    family_for_address, BOARDS_PER_FAMILY, CMD_GET_ADDRESS, CMD_GET_ID, FAMILIES,
};
use piplate_spi::transport::sim::{Fault, SimBus, SimPlate};
use piplate_spi::{
    Engine, EngineConfig, ExchangeRequest, HostError, Message, PlateDevice, ResponseShape,
};

/// Pi-Plate protocol tool
#[derive(Parser)]
#[command(name = "piplate")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "FRAME/ACK protocol engine for Pi-Plate boards on SPI")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration operations
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Plate family information
    #[command(subcommand)]
    Plates(PlateCommands),

    /// Run the engine against simulated plates
    #[command(subcommand)]
    Sim(SimCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the active configuration
    Show,

    /// Write a default configuration
    Init {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PlateCommands {
    /// List plate families and their addresses
    List,
}

#[derive(Subcommand)]
enum SimCommands {
    /// Send one command through the host adapter
    Exchange {
        /// Plate address
        #[arg(short, long)]
        addr: u8,

        /// Command byte
        #[arg(long)]
        cmd: u8,

        /// First parameter
        #[arg(long, default_value_t = 0)]
        p1: u8,

        /// Second parameter
        #[arg(long, default_value_t = 0)]
        p2: u8,

        /// Force ACK mode (default: from the plate family)
        #[arg(long, conflicts_with = "no_ack")]
        ack: bool,

        /// Force non-ACK mode
        #[arg(long)]
        no_ack: bool,

        /// Bytes to return: 0 none, N bytes, -1 identity string
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        len: i32,

        /// Fault to inject
        #[arg(long, value_enum)]
        fault: Option<FaultKind>,

        /// How many times the fault fires (0 = every time)
        #[arg(long, default_value_t = 1)]
        fault_count: u32,
    },

    /// Repeat identity and address queries against one plate
    Soak {
        /// Plate address
        #[arg(short, long)]
        addr: u8,

        /// Number of query pairs
        #[arg(short, long, default_value_t = 100)]
        iterations: u32,

        /// Inject one fault every N iterations (0 = never)
        #[arg(long, default_value_t = 0)]
        fault_every: u32,

        /// Fault to inject
        #[arg(long, value_enum, default_value_t = FaultKind::CorruptChecksum)]
        fault: FaultKind,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FaultKind {
    /// Verification byte off by one
    CorruptChecksum,
    /// Command transfer stalls for 2 ms
    Stall,
    /// Plate never signals its response on ACK
    AckStuckHigh,
    /// Plate ignores the command
    Idle,
    /// First response byte replaced with 0x80
    Glitch,
    /// SPI controller error
    TransferError,
}

impl FaultKind {
    fn fault(self) -> Fault {
        match self {
            FaultKind::CorruptChecksum => Fault::CorruptChecksum,
            FaultKind::Stall => Fault::Stall(Duration::from_millis(2)),
            FaultKind::AckStuckHigh => Fault::AckStuckHigh,
            FaultKind::Idle => Fault::IdleResponse,
            FaultKind::Glitch => Fault::Glitch(0x80),
            FaultKind::TransferError => Fault::TransferError,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let default_filter = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        config.debug_level.level_filter()
    };
    let env = env_logger::Env::default().default_filter_or(default_filter.as_str());
    env_logger::Builder::from_env(env).init();

    match cli.command {
        Commands::Config(cmd) => handle_config(cmd, &config),
        Commands::Plates(cmd) => handle_plates(cmd),
        Commands::Sim(cmd) => handle_sim(cmd, config),
    }
}

fn handle_config(cmd: ConfigCommands, config: &EngineConfig) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }

        ConfigCommands::Init { output } => {
            let rendered = EngineConfig::default().to_toml_string()?;
            if let Some(path) = output {
                std::fs::write(&path, &rendered)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!(
                    "{} Default configuration written to {}",
                    "[OK]".green().bold(),
                    path.display()
                );
            } else {
                println!("{}", rendered);
            }
        }
    }

    Ok(())
}

fn handle_plates(cmd: PlateCommands) -> Result<()> {
    match cmd {
        PlateCommands::List => {
            println!("{}", "=".repeat(60));
            println!("{}", "Plate Families".cyan().bold());
            println!("{}", "=".repeat(60));

            for family in FAMILIES {
                let last = family.base_address + BOARDS_PER_FAMILY - 1;
                println!("\n  {}: {}", family.id.white().bold(), family.name);
                println!("    Addresses: {}-{}", family.base_address, last);
                println!(
                    "    ACK wire: {}",
                    if family.uses_ack { "yes".green() } else { "no".dimmed() }
                );
                println!("    Identity: {}", family.id_string);
            }

            println!("\n{}", "=".repeat(60));
        }
    }

    Ok(())
}

/// One simulated board at every address of every family
fn simulated_stack() -> SimBus {
    SimBus::with_plates(FAMILIES.iter().flat_map(|family| {
        (0..BOARDS_PER_FAMILY).map(move |board| SimPlate::from_family(family, board))
    }))
}

fn ack_for(addr: u8, ack: bool, no_ack: bool) -> bool {
    if ack {
        true
    } else if no_ack {
        false
    } else {
        family_for_address(addr).map(|f| f.uses_ack).unwrap_or(false)
    }
}

fn handle_sim(cmd: SimCommands, config: EngineConfig) -> Result<()> {
    match cmd {
        SimCommands::Exchange {
            addr,
            cmd,
            p1,
            p2,
            ack,
            no_ack,
            len,
            fault,
            fault_count,
        } => {
            let mut bus = simulated_stack();
            if let Some(kind) = fault {
                if fault_count == 0 {
                    bus.inject_always(kind.fault());
                } else {
                    bus.inject(kind.fault(), fault_count);
                }
            }

            let engine = Engine::new(bus, config).context("Invalid engine configuration")?;
            let device = Arc::new(PlateDevice::new(engine));
            let handle = device.open();

            let use_ack = ack_for(addr, ack, no_ack);
            let mut message = Message::new(addr, cmd)
                .with_params(p1, p2)
                .with_ack(use_ack)
                .returning(len);

            println!(
                "{} Sending [{} {:#04x} {} {}] ({})",
                "[*]".cyan().bold(),
                addr,
                cmd,
                p1,
                p2,
                if use_ack { "ACK" } else { "non-ACK" }
            );

            match handle.send(&mut message) {
                Ok(()) => print_response(&message),
                Err(e) => {
                    report_host_error(&e);
                    std::process::exit(1);
                }
            }
        }

        SimCommands::Soak {
            addr,
            iterations,
            fault_every,
            fault,
        } => {
            let use_ack = family_for_address(addr).map(|f| f.uses_ack).unwrap_or(false);
            let mut engine =
                Engine::new(simulated_stack(), config).context("Invalid engine configuration")?;

            let id_query = ExchangeRequest::new(addr, CMD_GET_ID)
                .with_ack(use_ack)
                .expecting_text();
            let addr_query = ExchangeRequest::new(addr, CMD_GET_ADDRESS)
                .with_ack(use_ack)
                .expecting(1);

            let started = Local::now();
            println!(
                "{} [{}] Soaking address {} for {} iterations",
                "[*]".cyan().bold(),
                started.format("%H:%M:%S%.3f"),
                addr,
                iterations
            );

            let mut ok = 0u64;
            let mut restarts = 0u64;
            let mut failures = 0u64;
            for i in 0..iterations {
                if fault_every > 0 && i % fault_every == 0 {
                    engine.transport_mut().inject(fault.fault(), 1);
                }
                for request in [&id_query, &addr_query] {
                    match engine.exchange(request) {
                        Ok(result) => {
                            ok += 1;
                            restarts += u64::from(result.attempts() - 1);
                        }
                        Err(e) => {
                            failures += 1;
                            eprintln!("{} iteration {}: {}", "[ERROR]".red().bold(), i, e);
                        }
                    }
                }
            }

            let finished = Local::now();
            let total = u64::from(iterations) * 2;
            println!(
                "{} [{}] {}/{} exchanges succeeded, {} restarts, {} failures",
                if failures == 0 { "[OK]".green().bold() } else { "[WARNING]".yellow().bold() },
                finished.format("%H:%M:%S%.3f"),
                ok,
                total,
                restarts,
                failures
            );
            println!(
                "    Bus time: {:?} simulated, {} ms wall clock",
                engine.transport().elapsed(),
                (finished - started).num_milliseconds()
            );
        }
    }

    Ok(())
}

fn print_response(message: &Message) {
    println!("{} Command completed", "[OK]".green().bold());
    match ResponseShape::from_raw(message.bytes_to_return) {
        Some(ResponseShape::Text) => {
            let end = message.r_buf.iter().position(|&b| b == 0).unwrap_or(message.r_buf.len());
            let identity = String::from_utf8_lossy(&message.r_buf[..end]);
            println!("    Identity: {}", identity.white().bold());
        }
        Some(ResponseShape::Fixed(_)) => {
            let hex: Vec<String> = message.r_buf.iter().map(|b| format!("{:02x}", b)).collect();
            println!("    Data: {}", hex.join(" ").white().bold());
        }
        _ => {}
    }
}

fn report_host_error(err: &HostError) {
    eprintln!(
        "{} {} (errno {})",
        "[ERROR]".red().bold(),
        err,
        err.errno()
    );
}

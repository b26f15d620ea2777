//! Command-line tool for driving a YpsoPump over BLE.
//!
//! Pairs with a pump, then exposes the controller's command surface:
//! status, boluses, temporary basal rates, clock sync, basal profiles
//! and history.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use clap::{Parser, Subcommand};

use ypso_ble::{scan_for_pumps, BtlePumpLink, HistoryStream};
use ypso_controller::{BasalProgram, PumpController};
use ypso_proto::command::BolusKind;
use ypso_store::{keys, FileStore, Store};

#[derive(Parser)]
#[command(name = "ypso")]
#[command(about = "Drive a YpsoPump insulin pump over BLE")]
struct Cli {
    /// Path of the state file (default: ~/.ypso/state.json)
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for advertising pumps
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "15")]
        duration: u64,
    },
    /// Pair with a pump and run the initial key exchange
    Pair {
        /// Decimal serial number (the suffix of the advertised name)
        #[arg(short, long)]
        serial: u64,
        /// Key-exchange relay base URL
        #[arg(short, long)]
        relay_url: String,
    },
    /// Read delivery mode, reservoir and battery
    Status,
    /// Deliver a bolus
    Bolus {
        /// Total insulin units
        #[arg(short, long)]
        units: f64,
        /// Extended duration in minutes (0 = fast bolus)
        #[arg(short, long, default_value = "0")]
        duration: u32,
        /// Units delivered immediately when extended
        #[arg(short, long, default_value = "0")]
        immediate: f64,
    },
    /// Cancel the running bolus
    CancelBolus {
        /// Cancel the extended block instead of the fast one
        #[arg(long)]
        extended: bool,
    },
    /// Start a temporary basal rate
    Tbr {
        /// Percentage of the programmed rate (0..200)
        #[arg(short, long)]
        percent: u32,
        /// Duration in minutes (15-minute steps, max 1440)
        #[arg(short, long)]
        duration: u32,
    },
    /// Cancel the running temporary basal rate
    CancelTbr,
    /// Set the pump clock to the local time
    SyncTime,
    /// Read a basal program's 24 hourly rates
    Basal {
        /// Program to read: a or b
        #[arg(short, long, default_value = "a")]
        program: String,
    },
    /// Fetch recent history entries
    History {
        /// Stream to read: events, alerts or system
        #[arg(short, long, default_value = "events")]
        stream: String,
        /// Maximum number of entries
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
    /// Read the device information characteristics
    Info,
}

fn store_path(cli: &Cli) -> PathBuf {
    cli.store.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .expect("no home directory")
            .join(".ypso")
            .join("state.json")
    })
}

async fn controller(
    store: Arc<FileStore>,
) -> Result<PumpController<BtlePumpLink>, Box<dyn std::error::Error>> {
    let mac = store
        .get_string(keys::DEVICE_MAC)?
        .ok_or("no pump paired yet; run `ypso pair` first")?;
    let link = BtlePumpLink::new(&mac).await?;
    Ok(PumpController::new(link, store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(FileStore::open(store_path(&cli))?);

    match cli.command {
        Commands::Scan { duration } => {
            println!("Scanning for pumps ({duration} seconds)...");
            let pumps = scan_for_pumps(Duration::from_secs(duration)).await?;
            if pumps.is_empty() {
                println!("No pumps found.");
            }
            for pump in pumps {
                let rssi = pump
                    .rssi
                    .map(|r| format!("{r} dBm"))
                    .unwrap_or_else(|| "N/A".into());
                println!("  {} ({}) RSSI: {rssi}", pump.name, pump.address);
            }
        }

        Commands::Pair { serial, relay_url } => {
            store.put_string(keys::RELAY_URL, &relay_url)?;
            let mac = ypso_controller::mac_from_serial(serial);
            let link = BtlePumpLink::new(&mac).await?;
            let controller = PumpController::new(link, store);
            println!("Pairing with pump {serial} at {mac}...");
            controller.pair(serial).await?;
            println!("Paired. Session key exchanged and validated.");
        }

        Commands::Status => {
            let controller = controller(store).await?;
            let status = controller.status().await?;
            println!("Mode:      {:?}", status.mode);
            println!("Reservoir: {:.2} U", status.insulin_units);
            println!("Battery:   {}%", status.battery_percent);
        }

        Commands::Bolus { units, duration, immediate } => {
            let controller = controller(store).await?;
            println!("Delivering {units:.2} U...");
            let outcome = controller.deliver_bolus(units, duration, immediate).await?;
            match outcome.delivered_units {
                Some(delivered) => println!("Done: {delivered:.2} U in ({:?})", outcome.state),
                None => println!("Done ({:?})", outcome.state),
            }
        }

        Commands::CancelBolus { extended } => {
            let controller = controller(store).await?;
            let kind = if extended { BolusKind::Extended } else { BolusKind::Fast };
            match controller.cancel_bolus(kind).await? {
                Some(delivered) => println!("Cancelled; {delivered:.2} U were delivered."),
                None => println!("Cancelled."),
            }
        }

        Commands::Tbr { percent, duration } => {
            let controller = controller(store).await?;
            controller.set_tbr(percent, duration).await?;
            println!("TBR set to {percent}% for {duration} minutes.");
        }

        Commands::CancelTbr => {
            let controller = controller(store).await?;
            controller.cancel_tbr().await?;
            println!("TBR cancelled.");
        }

        Commands::SyncTime => {
            let controller = controller(store).await?;
            let now = Local::now();
            controller
                .sync_clock(
                    now.year() as u16,
                    now.month() as u8,
                    now.day() as u8,
                    now.hour() as u8,
                    now.minute() as u8,
                    now.second() as u8,
                )
                .await?;
            println!("Pump clock set to {}", now.format("%Y-%m-%d %H:%M:%S"));
        }

        Commands::Basal { program } => {
            let controller = controller(store).await?;
            let program = match program.to_ascii_lowercase().as_str() {
                "a" => BasalProgram::A,
                "b" => BasalProgram::B,
                other => return Err(format!("unknown program {other:?}, expected a or b").into()),
            };
            let rates = controller.read_basal_program(program).await?;
            for (hour, rate) in rates.iter().enumerate() {
                println!("  {hour:02}:00  {rate:.2} U/h");
            }
        }

        Commands::History { stream, limit } => {
            let controller = controller(store).await?;
            let stream = match stream.to_ascii_lowercase().as_str() {
                "events" => HistoryStream::Events,
                "alerts" => HistoryStream::Alerts,
                "system" => HistoryStream::System,
                other => {
                    return Err(
                        format!("unknown stream {other:?}, expected events, alerts or system")
                            .into(),
                    )
                }
            };
            let entries = controller.fetch_history(stream, limit).await?;
            if entries.is_empty() {
                println!("No entries.");
            }
            for entry in entries {
                let when = chrono::DateTime::from_timestamp(entry.timestamp as i64, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| entry.timestamp.to_string());
                match entry.event() {
                    Some(event) => println!("  {when}  {event:?}"),
                    None => println!(
                        "  {when}  type {} ({}, {}, {})",
                        entry.type_code, entry.value1, entry.value2, entry.value3
                    ),
                }
            }
        }

        Commands::Info => {
            let controller = controller(store).await?;
            let info = controller.device_info().await?;
            println!("Serial:       {}", info.serial);
            println!("Model:        {}", info.model);
            println!("Firmware:     {}", info.firmware);
            println!("Manufacturer: {}", info.manufacturer);
        }
    }

    Ok(())
}

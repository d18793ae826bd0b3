// tools/probe_scan_cli/main.rs
//
// Probe discovery diagnostic: runs the requested scans for a while, prints
// every device found, then reads the identity record of each.
//
//   probe_scan_cli --uart /dev/ttyUSB0 --seconds 5
//   probe_scan_cli --emulate 3 --json

use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ee31link::ee31::commands::{ProbeIdentity, ProbeIdentityGetParameter};
use ee31link::io::emulation::EmulatedDeviceSettings;
use ee31link::{
    BleScanConfig, ChannelInfo, DeviceManager, EmulationScanConfig, IoError, ProbeSettings,
    ResultCode, ScanConfiguration, ScanObserver, SharedChannel, UartScanConfig,
};

const EMULATED_MODELS: [&str; 4] = ["EE210", "EE871", "HTP501", "EE160"];

#[derive(Parser, Debug)]
#[command(name = "probe_scan_cli", about = "Discover EE31 probes and read their identity")]
struct Args {
    /// Scan for BLE probes
    #[arg(long)]
    ble: bool,

    /// Scan serial ports (all ports when PORT is omitted)
    #[arg(long, value_name = "PORT", num_args = 0..=1)]
    uart: Option<Option<String>>,

    /// Materialise N emulated probes
    #[arg(long, value_name = "N")]
    emulate: Option<u8>,

    /// How long background scans run
    #[arg(long, value_name = "S", default_value_t = 5)]
    seconds: u64,

    /// TOML settings file
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Also write the log to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,
}

struct PrintFound {
    quiet: bool,
}

impl ScanObserver for PrintFound {
    fn device_found(&self, _manager: &DeviceManager, channel: &SharedChannel) {
        if !self.quiet {
            println!("found  {}  {}", channel.key(), channel.model());
        }
    }

    fn scan_exception(&self, _manager: &DeviceManager, error: &IoError) {
        eprintln!("scan failed: {}", error);
    }
}

#[derive(Serialize)]
struct Report {
    device: ChannelInfo,
    code: ResultCode,
    identity: Option<ProbeIdentity>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), IoError> {
    if let Some(dir) = &args.log_dir {
        ee31link::logging::init_file_logging(dir).map_err(IoError::configuration)?;
    }

    let settings = match &args.settings {
        Some(path) => ProbeSettings::load(path)?,
        None => ProbeSettings::default(),
    };
    let line_settings = settings.uart_candidates.first().cloned().unwrap_or_default();

    let manager = DeviceManager::with_system_ports(settings);
    manager.add_observer(Arc::new(PrintFound { quiet: args.json }));

    // A BLE scan drops emulated channels, start it first
    if args.ble {
        manager
            .start_scan(ScanConfiguration::Ble(BleScanConfig::default()))
            .await?;
    }
    if let Some(count) = args.emulate {
        let devices = (1..=count)
            .map(|address| {
                let model = EMULATED_MODELS[usize::from(address - 1) % EMULATED_MODELS.len()];
                EmulatedDeviceSettings::new(address, model)
            })
            .collect();
        manager
            .start_scan(ScanConfiguration::Emulation(EmulationScanConfig { devices }))
            .await?;
    }
    if let Some(port) = args.uart.clone() {
        manager
            .start_scan(ScanConfiguration::Uart(UartScanConfig::new(port, line_settings)))
            .await?;
    }

    if args.ble || args.uart.is_some() {
        tokio::time::sleep(Duration::from_secs(args.seconds)).await;
        manager.stop_scan().await;
    }

    let mut reports = Vec::new();
    for channel in manager.devices() {
        let exec = manager.executor(channel.clone());
        let response = exec.execute(&ProbeIdentityGetParameter).await;
        let identity = response.is_success().then(|| response.result.identity.clone());
        if !args.json {
            match &identity {
                Some(id) => println!(
                    "ident  {}  name={:?} ee={} calib={} retries={} timeout={:?}",
                    channel.key(),
                    id.name,
                    id.is_ee_probe,
                    id.calib_expiration
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    id.retries,
                    id.timeout
                ),
                None => println!("ident  {}  {}", channel.key(), response.code),
            }
        }
        reports.push(Report {
            device: channel.info(),
            code: response.code,
            identity,
        });
        let _ = channel.disconnect().await;
    }

    if args.json {
        let text = serde_json::to_string_pretty(&reports)
            .map_err(|e| IoError::protocol("json", e.to_string()))?;
        println!("{}", text);
    } else if reports.is_empty() {
        println!("no probes found");
    }

    ee31link::logging::stop_file_logging();
    Ok(())
}

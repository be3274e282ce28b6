//! CLI entry point for the IPTV transcoding proxy
//!
//! Parses command line arguments, initialises logging and starts the daemon.

use clap::Parser;
use iptv_transcode_daemon::config::LogFormat;
use iptv_transcode_daemon::{discover_hardware, Config, Daemon, HardwareCatalog, TranscodeMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Real-time IPTV transcoding proxy with hardware acceleration
#[derive(Parser, Debug)]
#[command(name = "iptv-transcoded")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; missing means defaults
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Hardware device: auto, none, <kind> or <kind>:<index>
    #[arg(long)]
    hardware_device: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, default_value = "false")]
    log_json: bool,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Print the discovered hardware and exit
    #[arg(long, default_value = "false")]
    list_hardware: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.bind_addr = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(device) = &self.hardware_device {
            config.hardware.device = device.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.format = LogFormat::Json;
        }
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).compact())
            .try_init(),
    };
    result.map_err(|e| format!("Failed to initialize logging: {}", e))
}

fn print_catalog(catalog: &HardwareCatalog) {
    println!("Available hardware devices:");
    for device in catalog.iter() {
        let codecs: Vec<&str> = device.capabilities.iter().map(String::as_str).collect();
        println!(
            "  {:<10} {:<32} [{}]{}",
            device.id(),
            device.display_name,
            codecs.join(", "),
            if device.available { "" } else { " (unavailable)" }
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    if let Err(e) = init_logging(&config.logging.level, config.logging.format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    if args.list_hardware {
        let catalog = discover_hardware(&config).await;
        print_catalog(&catalog);
        return ExitCode::SUCCESS;
    }

    info!(config = %args.config.display(), "IPTV transcoding proxy starting");

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        let catalog = if config.transcode.mode == TranscodeMode::Copy {
            HardwareCatalog::cpu_only()
        } else {
            discover_hardware(&config).await
        };
        Daemon::new_without_checks(config, catalog)
    } else {
        Daemon::new(config).await
    };

    match daemon_result {
        Ok(daemon) => {
            info!(
                mode = %daemon.config.transcode.mode,
                video_codec = %daemon.config.transcode.video_codec,
                hardware = %daemon.config.hardware.device,
                devices = daemon.catalog.len(),
                "Daemon initialized"
            );

            if let Err(e) = daemon.run().await {
                error!("Daemon error: {}", e);
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "iptv-transcoded",
            "--bind",
            "127.0.0.1",
            "--port",
            "9000",
            "--hardware-device",
            "nvidia:1",
            "--log-level",
            "debug",
            "--log-json",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.hardware.device, "nvidia:1");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_leave_config_untouched() {
        let args = Args::parse_from(["iptv-transcoded"]);
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert!(!args.list_hardware);

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config, Config::default());
    }
}

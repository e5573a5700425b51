//! zivmeter - poll a Ziv electricity meter over its optical port
//!
//! Runs the read cycle on a single-threaded runtime: one interval ticks the
//! poller, another starts a new cycle every `update_interval_ms`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use zivmeter_core::config::{MeterConfig, ReadConfig};
use zivmeter_core::demo::DemoMeter;
use zivmeter_core::dlms::DlmsCodec;
use zivmeter_core::poller::{MeterPoller, ReadStep};
use zivmeter_core::protocol::{list_ports, open_port, CommunicationEngine, SerialTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "zivmeter", author, version, about = "Read a Ziv meter over DLMS/HDLC", long_about = None)]
struct Args {
    /// Configuration file (JSON); built-in defaults when omitted
    #[arg(short, long, env = "ZIVMETER_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Talk to the simulated meter instead of a serial port
    #[arg(long)]
    demo: bool,

    /// Run a single read cycle and exit with its status
    #[arg(long)]
    once: bool,

    /// Print each reading as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Log level, RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

/// One reading as printed with `--json`
#[derive(Debug, Serialize)]
struct ReadingLine<'a> {
    name: &'a str,
    value: f64,
    #[serde(skip_serializing_if = "str::is_empty")]
    unit: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<MeterConfig> {
    let mut config = match &args.config {
        Some(path) => MeterConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MeterConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port.name = port.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Render a reading for stdout
fn reading_json(read: &ReadConfig, value: f64) -> Option<String> {
    let sensor = read.sensor.as_ref();
    let line = ReadingLine {
        name: &read.name,
        value,
        unit: sensor.map_or("", |s| s.unit.as_str()),
        device_class: sensor.and_then(|s| s.device_class.as_deref()),
    };
    match serde_json::to_string(&line) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("{}: cannot serialize reading: {e}", read.name);
            None
        }
    }
}

/// Read steps with a sink for every configured sensor
fn read_steps(config: &MeterConfig, json: bool) -> Vec<ReadStep> {
    let mut steps = config.read_steps();
    for (step, read) in steps.iter_mut().zip(&config.reads) {
        let Some(sensor) = read.sensor.clone() else {
            continue;
        };
        let read = read.clone();
        step.sink = Some(Box::new(move |value: f64| {
            tracing::info!("{} = {}", read.name, sensor.format(value));
            if json {
                if let Some(line) = reading_json(&read, value) {
                    println!("{line}");
                }
            }
        }));
    }
    steps
}

async fn next_update(update: &mut Option<Interval>) {
    match update {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drive the poller until Ctrl-C, or after one cycle without an update interval
async fn drive<T: Transport>(
    mut poller: MeterPoller<T, DlmsCodec>,
    config: &MeterConfig,
    once: bool,
) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let single = once || config.update_interval_ms.is_none();
    let mut update = if single {
        None
    } else {
        config
            .update_interval_ms
            .map(|ms| tokio::time::interval(Duration::from_millis(ms)))
    };

    poller.log_config();
    poller.update();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                poller.advance();
                if single && poller.is_idle() {
                    break;
                }
            }
            _ = next_update(&mut update) => poller.update(),
            _ = &mut ctrl_c => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    let stats = poller.stats();
    tracing::info!(
        "{} cycles completed, {} failed, {} readings published",
        stats.completed_cycles,
        stats.failed_cycles,
        stats.published
    );
    if single && stats.failed_cycles > 0 {
        bail!("read cycle failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.list_ports {
        for port in list_ports() {
            match port.product {
                Some(product) => println!("{}\t{product}", port.name),
                None => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    let reads = read_steps(&config, args.json);
    let codec = DlmsCodec::new(config.link.clone());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if args.demo {
        tracing::info!("using the simulated meter");
        let meter = DemoMeter::realtime(&config.link);
        let engine = CommunicationEngine::new(meter, codec, config.engine.clone());
        runtime.block_on(drive(MeterPoller::new(engine, reads), &config, args.once))
    } else {
        let port = open_port(&config.port.name, Some(config.port.baud_rate))
            .with_context(|| format!("opening {}", config.port.name))?;
        tracing::info!("opened {} at {} baud", config.port.name, config.port.baud_rate);
        let engine = CommunicationEngine::new(SerialTransport::new(port), codec, config.engine.clone());
        runtime.block_on(drive(MeterPoller::new(engine, reads), &config, args.once))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["zivmeter", "--demo", "--once", "--json", "-p", "/dev/ttyUSB1"]).unwrap();
        assert!(args.demo && args.once && args.json);
        assert_eq!(args.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(args.log_level, "info");
        assert!(!args.list_ports);
    }

    #[test]
    fn test_port_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "port": {{ "name": "/dev/ttyACM0" }}, "update_interval_ms": 5000 }}"#).unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = Args::try_parse_from(["zivmeter", "-c", &path]).unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.port.name, "/dev/ttyACM0");
        assert_eq!(config.update_interval_ms, Some(5000));

        let args = Args::try_parse_from(["zivmeter", "-c", &path, "--port", "COM3"]).unwrap();
        assert_eq!(load_config(&args).unwrap().port.name, "COM3");
    }

    #[test]
    fn test_reading_json() {
        let config = MeterConfig::default();
        let line = reading_json(&config.reads[2], 5000.0).unwrap();
        assert_eq!(
            line,
            r#"{"name":"Import power","value":5000.0,"unit":"W","device_class":"power"}"#
        );
    }

    #[test]
    fn test_sinks_follow_sensors() {
        let mut config = MeterConfig::default();
        config.reads[1].sensor = None;
        let steps = read_steps(&config, false);
        let bound: Vec<bool> = steps.iter().map(|s| s.sink.is_some()).collect();
        assert_eq!(bound, vec![true, false, true, true]);
    }

    #[tokio::test]
    async fn test_single_demo_cycle() {
        let config = MeterConfig {
            tick_interval_ms: 2,
            ..MeterConfig::default()
        };
        let engine = CommunicationEngine::new(
            DemoMeter::realtime(&config.link),
            DlmsCodec::new(config.link.clone()),
            config.engine.clone(),
        );
        let poller = MeterPoller::new(engine, read_steps(&config, false));
        drive(poller, &config, true).await.unwrap();
    }
}

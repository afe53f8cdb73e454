use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use toby_gsm::bus::JsonBus;
use toby_gsm::{Config, GsmTask};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(
        short = 'd',
        long = "device",
        default_value = "/dev/ttyACM0",
        help = "Serial device of the modem's CDC-ACM interface"
    )]
    device: String,

    #[arg(long = "baud", default_value_t = 115_200, help = "Serial baud rate")]
    baud: u32,

    #[arg(
        long = "power-channel",
        default_value = "SAT_GSM",
        help = "Power channel feeding the modem"
    )]
    power_channel: String,

    #[arg(
        long = "apn",
        default_value = "web.vodafone.de",
        help = "Access point name for packet data"
    )]
    apn: String,

    #[arg(
        long = "pin",
        env = "TOBY_GSM_PIN",
        default_value = "",
        help = "SIM PIN. Can also be set via TOBY_GSM_PIN"
    )]
    pin: String,

    #[arg(
        long = "rssi-period",
        default_value_t = 10.0,
        help = "Signal strength query period, seconds"
    )]
    rssi_period: f64,

    #[arg(
        long = "network-period",
        default_value_t = 5.0,
        help = "Network supervision period, seconds"
    )]
    network_period: f64,

    #[arg(
        long = "report-period",
        default_value_t = 5.0,
        help = "Signal/latency report period, seconds"
    )]
    report_period: f64,

    #[arg(
        long = "sms-timeout",
        default_value_t = 60.0,
        help = "SMS send completion timeout, seconds"
    )]
    sms_timeout: f64,

    #[arg(long = "start-gsm", help = "Ask the host to power the channel on at start")]
    start_gsm: bool,

    #[arg(
        long = "settle-delay",
        default_value_t = 20.0,
        help = "Wait after power-on for USB enumeration, seconds"
    )]
    settle_delay: f64,

    #[arg(
        long = "wait-power-channel",
        help = "Block until a PowerChannelState notification arrives instead of assuming the modem is powered"
    )]
    wait_power_channel: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cfg = Config {
        uart_dev: cli.device,
        uart_baud: cli.baud,
        pwr_channel_name: cli.power_channel,
        apn: cli.apn,
        pin: cli.pin,
        rssi_period: cli.rssi_period,
        ntwk_period: cli.network_period,
        report_period: cli.report_period,
        sms_timeout: cli.sms_timeout,
        start_gsm: cli.start_gsm,
        post_power_on_delay: cli.settle_delay,
    };

    info!(dev = %cfg.uart_dev, apn = %cfg.apn, "starting TOBY-L2 supervision");
    let mut task = GsmTask::new(cfg.clone(), Arc::new(JsonBus::stdout()));

    if !cli.wait_power_channel {
        // Without a host power controller, treat the channel as already on.
        task.power_monitor()
            .on_power_channel_state(&cfg.pwr_channel_name, true);
    }

    let stop = AtomicBool::new(false);
    task.run(&stop)
}

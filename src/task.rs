//! Task wrapper: resource acquisition, the main loop, and the
//! restart-on-failure policy.
//!
//! Wire-level anomalies are handled by tearing everything down and
//! re-acquiring from cold: the serial port is reopened, bootstrap reruns,
//! and the SMS queue starts empty. Application-level trouble (registration
//! flaps, refused messages) never reaches this layer; the state machine
//! absorbs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::{Bus, HostMessage, PowerChannelOp};
use crate::config::Config;
use crate::error::{ModemError, Result};
use crate::modem::TobyL2;
use crate::sms::{SmsGateway, SmsQueue};
use crate::timer::Counter;

/// Poll interval while waiting for the power channel.
const CHANNEL_POLL: Duration = Duration::from_secs(2);

/// Main-loop yield, leaving room for bus callbacks between ticks.
const BUS_YIELD: Duration = Duration::from_millis(50);

/// Serial read poll; actual deadlines are enforced by the reader.
const SERIAL_POLL: Duration = Duration::from_millis(100);

/// Updates the shared power-channel flag from host notifications. Safe to
/// call from the bus thread.
pub struct PowerChannelMonitor {
    name: String,
    on: Arc<AtomicBool>,
}

impl PowerChannelMonitor {
    pub fn on_power_channel_state(&self, name: &str, on: bool) {
        if name == self.name {
            self.on.store(on, Ordering::SeqCst);
        }
    }
}

/// The supervision task. Owns the serial port for its whole lifetime and
/// runs everything on the calling thread.
pub struct GsmTask {
    cfg: Config,
    bus: Arc<dyn Bus>,
    queue: Arc<SmsQueue>,
    channel_on: Arc<AtomicBool>,
}

impl GsmTask {
    pub fn new(cfg: Config, bus: Arc<dyn Bus>) -> Self {
        GsmTask {
            cfg,
            bus,
            queue: Arc::new(SmsQueue::new()),
            channel_on: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Host-side SMS submission endpoint, detachable onto the bus thread.
    pub fn sms_gateway(&self) -> SmsGateway {
        SmsGateway::new(self.queue.clone(), self.bus.clone())
    }

    /// Host-side power-channel notification endpoint.
    pub fn power_monitor(&self) -> PowerChannelMonitor {
        PowerChannelMonitor {
            name: self.cfg.pwr_channel_name.clone(),
            on: self.channel_on.clone(),
        }
    }

    /// Runs until `stop` is raised. Failures tear the session down and
    /// re-run acquisition from cold.
    pub fn run(&mut self, stop: &AtomicBool) -> eyre::Result<()> {
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once(stop) {
                warn!("GSM task failed, restarting: {e:#}");
                self.queue.clear();
            }
        }
        info!("GSM task stopped");
        Ok(())
    }

    fn run_once(&mut self, stop: &AtomicBool) -> Result<()> {
        let Some(mut modem) = self.acquire(stop)? else {
            return Ok(());
        };
        let mut report_timer = Counter::from_secs(self.cfg.report_period);
        while !stop.load(Ordering::SeqCst) {
            if report_timer.overflow() {
                self.bus.dispatch(HostMessage::Rssi {
                    value: modem.rssi_percent() as f32,
                });
                self.bus.dispatch(HostMessage::LinkLatency {
                    value: modem.link_latency_secs(),
                });
                report_timer.reset();
            }
            modem.update()?;
            thread::sleep(BUS_YIELD);
        }
        Ok(())
    }

    /// Waits for power, lets the kernel enumerate the CDC-ACM device,
    /// opens the port and bootstraps the modem. Returns `None` when asked
    /// to stop while still waiting.
    fn acquire(&self, stop: &AtomicBool) -> Result<Option<TobyL2<Box<dyn serialport::SerialPort>>>> {
        while !self.channel_on.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
            thread::sleep(CHANNEL_POLL);
            if self.cfg.start_gsm {
                self.bus.dispatch(HostMessage::PowerChannelControl {
                    name: self.cfg.pwr_channel_name.clone(),
                    op: PowerChannelOp::TurnOn,
                });
            }
            info!(
                channel = %self.cfg.pwr_channel_name,
                "waiting for the GSM power channel to be turned on"
            );
        }
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }

        // Give the kernel time to enumerate the USB device.
        thread::sleep(Duration::from_secs_f64(self.cfg.post_power_on_delay));

        let port = serialport::new(&self.cfg.uart_dev, self.cfg.uart_baud)
            .timeout(SERIAL_POLL)
            .open()
            .map_err(|e| ModemError::SerialGone(e.into()))?;
        info!(dev = %self.cfg.uart_dev, baud = self.cfg.uart_baud, "serial port open");

        let mut modem = TobyL2::new(port, self.cfg.clone(), self.queue.clone(), self.bus.clone());
        modem.bootstrap()?;
        Ok(Some(modem))
    }
}

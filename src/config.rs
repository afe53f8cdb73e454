/// Runtime configuration for the supervision task.
///
/// A handful of fields cannot be changed while the modem is up: a new PIN,
/// APN, or serial endpoint only takes effect through a full restart of the
/// task (bootstrap reprograms them into the module). The periods and the
/// SMS send timeout are hot-applied to the running timers.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Serial device of the modem's CDC-ACM interface.
    pub uart_dev: String,
    /// Serial baud rate.
    pub uart_baud: u32,
    /// Power channel feeding the modem.
    pub pwr_channel_name: String,
    /// Access point name for packet data.
    pub apn: String,
    /// SIM PIN; empty when the SIM is unlocked.
    pub pin: String,
    /// RSSI query period, seconds.
    pub rssi_period: f64,
    /// Network supervision period, seconds.
    pub ntwk_period: f64,
    /// Network report period, seconds.
    pub report_period: f64,
    /// SMS send completion timeout, seconds.
    pub sms_timeout: f64,
    /// Ask the host to turn the power channel on at start.
    pub start_gsm: bool,
    /// Wait after channel-on for the kernel to enumerate the USB device,
    /// seconds.
    pub post_power_on_delay: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            uart_dev: "/dev/ttyACM0".into(),
            uart_baud: 115_200,
            pwr_channel_name: "SAT_GSM".into(),
            apn: "web.vodafone.de".into(),
            pin: String::new(),
            rssi_period: 10.0,
            ntwk_period: 5.0,
            report_period: 5.0,
            sms_timeout: 60.0,
            start_gsm: false,
            post_power_on_delay: 20.0,
        }
    }
}

impl Config {
    /// True when switching to `new` needs a task restart instead of a hot
    /// apply.
    pub fn requires_restart(&self, new: &Config) -> bool {
        self.pin != new.pin
            || self.uart_dev != new.uart_dev
            || self.uart_baud != new.uart_baud
            || self.apn != new.apn
    }
}

/// Result of pushing a new configuration at a running driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// All changes were applied in place.
    Applied,
    /// The change touches bootstrap-time state; tear the task down and
    /// reconstruct it with the new configuration.
    RestartNeeded,
}

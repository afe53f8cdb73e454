//! TOBY-L2 driver: one-shot bootstrap, periodic supervision, SMS exchange.
//!
//! The driver owns the AT engine by composition and is generic over the
//! transport, so the whole protocol surface runs against a scripted mock in
//! tests. All methods execute on the task thread; the only shared state is
//! the SMS queue.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::at::{failure_detail, AtLink};
use crate::bus::{Bus, DeliveryStatus, HostMessage};
use crate::config::{Config, ReloadOutcome};
use crate::error::{ModemError, Result};
use crate::sms::{self, now_since_epoch, InboundBody, SmsQueue, SmsRequest};
use crate::timer::Counter;

/// Reachability probe target for `+UPING`.
const PING_HOST: &str = "www.google.com";

/// Consecutive ping failures tolerated before supervision starts over.
const PING_FAILURE_LIMIT: u32 = 5;

/// Settle time after `+CFUN=16` while the module reboots its AT engine.
const RESET_SETTLE: Duration = Duration::from_secs(2);

/// The 4-byte payload prompt the module emits after `+CMGS`.
const SMS_PROMPT: &[u8; 4] = b"\r\n> ";

const CTRL_Z: u8 = 0x1a;

/// Supervision lifecycle. Advances one level per tick; the only backward
/// edge is the reset to `Initial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    Initial,
    SimReady,
    Registered,
    PdpAttached,
    Online,
}

/// Radio access technology, from the `<AcT>` field of `+COPS?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioTech {
    GsmCompact,
    Utran,
    Edge,
    Hsdpa,
    Hsupa,
    HsdpaHsupa,
    Lte,
}

impl RadioTech {
    fn from_act(act: i64) -> Option<RadioTech> {
        match act {
            1 => Some(RadioTech::GsmCompact),
            2 => Some(RadioTech::Utran),
            3 => Some(RadioTech::Edge),
            4 => Some(RadioTech::Hsdpa),
            5 => Some(RadioTech::Hsupa),
            6 => Some(RadioTech::HsdpaHsupa),
            7 => Some(RadioTech::Lte),
            _ => None,
        }
    }
}

/// Read once during bootstrap.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub imei: String,
    pub imsi: String,
    pub phone_number: Option<String>,
}

enum PingOutcome {
    /// Round-trip time in milliseconds.
    Rtt(f64),
    Failed,
    /// `+UUPINGER: 17`, the module has no PSD profile yet.
    NoProfile,
}

pub struct TobyL2<T> {
    at: AtLink<T>,
    cfg: Config,
    queue: Arc<SmsQueue>,
    bus: Arc<dyn Bus>,
    state: LinkState,
    identity: Identity,
    rssi_timer: Counter,
    ntwk_timer: Counter,
    sms_timeout: Duration,
    rssi_percent: f64,
    /// Last successful ping RTT in milliseconds, 0.0 before the first sample.
    ping_ms: f64,
    ping_failures: u32,
    reset_settle: Duration,
}

impl<T: Read + Write> TobyL2<T> {
    pub fn new(io: T, cfg: Config, queue: Arc<SmsQueue>, bus: Arc<dyn Bus>) -> Self {
        TobyL2 {
            at: AtLink::new(io),
            rssi_timer: Counter::from_secs(cfg.rssi_period),
            ntwk_timer: Counter::from_secs(cfg.ntwk_period),
            sms_timeout: Duration::from_secs_f64(cfg.sms_timeout),
            cfg,
            queue,
            bus,
            state: LinkState::Initial,
            identity: Identity::default(),
            rssi_percent: 0.0,
            ping_ms: 0.0,
            ping_failures: 0,
            reset_settle: RESET_SETTLE,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Signal strength as percent 0..100, from the last `+CSQ` sample.
    pub fn rssi_percent(&self) -> f64 {
        self.rssi_percent
    }

    /// Last ping RTT in seconds, 0.0 until the first successful probe.
    pub fn link_latency_secs(&self) -> f64 {
        if self.ping_ms != 0.0 {
            self.ping_ms / 1000.0
        } else {
            self.ping_ms
        }
    }

    /// Applies a new configuration in place where possible. Bootstrap-time
    /// fields (PIN, APN, serial endpoint) cannot change under a live modem.
    pub fn reconfigure(&mut self, new: &Config) -> ReloadOutcome {
        if self.cfg.requires_restart(new) {
            return ReloadOutcome::RestartNeeded;
        }
        self.rssi_timer.set_top_secs(new.rssi_period);
        self.ntwk_timer.set_top_secs(new.ntwk_period);
        self.sms_timeout = Duration::from_secs_f64(new.sms_timeout);
        self.cfg = new.clone();
        ReloadOutcome::Applied
    }

    /// One-shot initialization: reset, echo off, airplane-mode cycle,
    /// identity readout, PIN unlock, APN provisioning, SMS text mode, radio
    /// on. Runs exactly once per task acquisition.
    pub fn bootstrap(&mut self) -> Result<()> {
        info!("resetting modem");
        self.at.send("+CFUN=16").map_err(|e| e.at_step("reset"))?;
        // The module drops the AT interface while it reboots.
        thread::sleep(self.reset_settle);
        self.at.flush_input().map_err(|e| e.at_step("reset"))?;

        self.simple("", "liveness")?;
        self.simple("E0", "echo off")?;
        self.simple("+CFUN=4", "airplane mode")?;

        self.identity.imei = self
            .at
            .read_bare("+CGSN")
            .map_err(|e| e.at_step("imei"))?;
        info!(imei = %self.identity.imei, "modem identity");

        self.simple("+CMEE=2", "error verbosity")?;
        self.unlock_sim().map_err(|e| e.at_step("sim unlock"))?;

        self.identity.imsi = self
            .at
            .read_bare("+CIMI")
            .map_err(|e| e.at_step("imsi"))?;
        info!(imsi = %self.identity.imsi, "SIM identity");

        // Not every SIM stores its MSISDN; missing is fine.
        match self.at.read_value("+CNUM") {
            Ok(line) => self.identity.phone_number = parse_cnum(&line),
            Err(ModemError::UnexpectedReply { .. }) => {
                debug!("no phone number stored on SIM");
            }
            Err(e) => return Err(e.at_step("phone number")),
        }

        self.simple(&format!("+CGDCONT=1,\"IP\",\"{}\"", self.cfg.apn), "apn")?;
        self.simple(&format!("+UCGDFLT=1,\"IP\",\"{}\"", self.cfg.apn), "apn")?;

        self.simple("+CMGF=1", "sms text mode")?;
        self.simple("+CSCS=\"IRA\"", "sms text mode")?;
        self.simple("+CNMI=2,2", "sms text mode")?;

        // Plain +CFUN=1 rather than the silent-reset variant, so the PDP
        // attach that follows is not raced by a module restart.
        self.simple("+CFUN=1", "radio on")?;

        info!("modem bootstrap complete");
        Ok(())
    }

    fn simple(&mut self, cmd: &str, step: &'static str) -> Result<()> {
        self.at
            .send(cmd)
            .and_then(|()| self.at.expect_ok())
            .map_err(|e| e.at_step(step))
    }

    fn unlock_sim(&mut self) -> Result<()> {
        let status = self.at.read_value("+CPIN?")?;
        match status.as_str() {
            "+CPIN: READY" => Ok(()),
            "+CPIN: SIM PIN" => {
                if self.cfg.pin.is_empty() {
                    return Err(ModemError::unexpected(
                        "SIM requires a PIN but none is configured",
                    ));
                }
                self.at.send(&format!("+CPIN={}", self.cfg.pin))?;
                self.at.expect_ok()?;
                let status = self.at.read_value("+CPIN?")?;
                if status == "+CPIN: READY" {
                    Ok(())
                } else {
                    Err(ModemError::unexpected(format!("SIM still locked: {status}")))
                }
            }
            other => Err(ModemError::unexpected(format!("unusable SIM: {other}"))),
        }
    }

    /// Periodic entry point, called from the task loop. Each timer fires at
    /// most once per call; a tick missed during a long transaction coalesces
    /// into the next one.
    pub fn update(&mut self) -> Result<()> {
        if self.rssi_timer.overflow() {
            if self.state >= LinkState::Registered {
                self.query_rssi()?;
            }
            self.rssi_timer.reset();
        }
        if self.ntwk_timer.overflow() {
            self.step_network()?;
            self.ntwk_timer.reset();
        }
        Ok(())
    }

    /// One supervision tick: poll SMS when the data path is far enough
    /// along, then advance the link state by at most one level.
    fn step_network(&mut self) -> Result<()> {
        if self.state > LinkState::Registered {
            self.check_messages()?;
            self.process_sms_queue()?;
        }

        let next = match self.state {
            LinkState::Initial => {
                if self.sim_ready()? {
                    LinkState::SimReady
                } else {
                    warn!("SIM card Error");
                    LinkState::Initial
                }
            }
            LinkState::SimReady => {
                if self.network_registered()? {
                    LinkState::Registered
                } else {
                    LinkState::SimReady
                }
            }
            LinkState::Registered => match self.radio_tech()? {
                Some(RadioTech::Lte) => LinkState::PdpAttached,
                Some(rat) => {
                    if self.active_context()?.is_none() {
                        debug!(?rat, "activating PDP context");
                        self.at.send("+CGACT=1,1")?;
                        self.at.expect_ok()?;
                    }
                    LinkState::PdpAttached
                }
                None => LinkState::Registered,
            },
            LinkState::PdpAttached => {
                if self.active_context()?.is_some() {
                    LinkState::Online
                } else {
                    LinkState::Initial
                }
            }
            LinkState::Online => self.check_online()?,
        };

        if next != self.state {
            info!(from = ?self.state, to = ?next, "link state changed");
            self.state = next;
        }
        Ok(())
    }

    fn check_online(&mut self) -> Result<LinkState> {
        let Some(cid) = self.active_context()? else {
            warn!("PDP context lost");
            return Ok(LinkState::Initial);
        };

        match self.ping()? {
            PingOutcome::NoProfile => {
                info!(cid, "no PSD profile, provisioning the internal stack");
                self.setup_psd(cid)?;
                Ok(LinkState::Online)
            }
            PingOutcome::Failed => {
                self.ping_failures += 1;
                warn!(failures = self.ping_failures, "ping failed");
                if self.ping_failures > PING_FAILURE_LIMIT - 1 {
                    self.ping_failures = 0;
                    Ok(LinkState::Initial)
                } else {
                    Ok(LinkState::Online)
                }
            }
            PingOutcome::Rtt(ms) => {
                debug!(rtt_ms = ms, "ping ok");
                self.ping_failures = 0;
                self.ping_ms = ms;
                Ok(LinkState::Online)
            }
        }
    }

    fn sim_ready(&mut self) -> Result<bool> {
        match self.at.read_value("+CPIN?") {
            Ok(line) => Ok(line == "+CPIN: READY"),
            // A missing or faulty SIM answers +CME ERROR; that is a SIM
            // problem, not a wire problem.
            Err(ModemError::UnexpectedReply { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn network_registered(&mut self) -> Result<bool> {
        let line = self.at.read_value("+CREG?")?;
        let stat = line
            .strip_prefix("+CREG:")
            .and_then(|rest| rest.split(',').nth(1))
            .and_then(|field| field.trim().parse::<i64>().ok());
        Ok(matches!(stat, Some(1 | 5)))
    }

    fn radio_tech(&mut self) -> Result<Option<RadioTech>> {
        let line = self.at.read_value("+COPS?")?;
        let act = line
            .strip_prefix("+COPS:")
            .and_then(|rest| rest.split(',').nth(3))
            .and_then(|field| field.trim().parse::<i64>().ok());
        Ok(act.and_then(RadioTech::from_act))
    }

    /// Scans `+CGACT?` rows; returns the CID of the first active context.
    fn active_context(&mut self) -> Result<Option<u8>> {
        self.at.send("+CGACT?")?;
        let mut active = None;
        loop {
            let line = self.at.read_line()?;
            if line == "OK" {
                break;
            }
            if let Some(detail) = failure_detail(&line) {
                return Err(ModemError::unexpected(detail));
            }
            let row = line.strip_prefix("+CGACT:").ok_or_else(|| {
                ModemError::unexpected(format!("unexpected +CGACT? row: {line:?}"))
            })?;
            let mut fields = row.split(',');
            let cid = fields
                .next()
                .and_then(|f| f.trim().parse::<u8>().ok());
            let state = fields
                .next()
                .and_then(|f| f.trim().parse::<i64>().ok())
                .unwrap_or(0);
            if state > 0 && active.is_none() {
                active = cid;
            }
        }
        Ok(active)
    }

    fn ping(&mut self) -> Result<PingOutcome> {
        self.at
            .send(&format!("+UPING=\"{PING_HOST}\",1,32,5000,255"))?;
        match self.at.expect_ok() {
            Ok(()) => {}
            Err(ModemError::UnexpectedReply { detail }) => {
                debug!(%detail, "ping command rejected");
                return Ok(PingOutcome::Failed);
            }
            Err(e) => return Err(e),
        }
        // The result arrives as an unsolicited line after the OK.
        match self.at.read_line() {
            Ok(line) => Ok(classify_ping_line(&line)),
            Err(ModemError::TimedOut) => Ok(PingOutcome::Failed),
            Err(e) => Err(e),
        }
    }

    /// Maps the modem's internal PSD profile 0 onto the active PDP context
    /// and activates it, so `+UPING` has an IP stack to run on.
    fn setup_psd(&mut self, cid: u8) -> Result<()> {
        self.at.send(&format!("+UPSD=0,100,{cid}"))?;
        self.at.expect_ok()?;
        self.at.send("+UPSD=0,0,0")?;
        self.at.expect_ok()?;
        self.at.send("+UPSDA=0,3")?;
        self.at.expect_ok()?;
        Ok(())
    }

    fn query_rssi(&mut self) -> Result<()> {
        let line = self.at.read_value("+CSQ")?;
        let raw = line
            .strip_prefix("+CSQ:")
            .and_then(|rest| rest.split(',').next())
            .and_then(|field| field.trim().parse::<i64>().ok())
            .ok_or_else(|| ModemError::unexpected(format!("bad +CSQ reply: {line:?}")))?;
        self.rssi_percent = rssi_to_percent(raw);
        debug!(raw, percent = self.rssi_percent, "signal strength");
        Ok(())
    }

    /// Drains at most one outbound request per tick, soonest deadline
    /// first, to bound serial occupancy.
    fn process_sms_queue(&mut self) -> Result<()> {
        let Some(req) = self.queue.pop() else {
            return Ok(());
        };
        if now_since_epoch() >= req.deadline {
            info!(req_id = req.req_id, "SMS request expired in queue");
            sms::dispatch_status(
                self.bus.as_ref(),
                &req,
                DeliveryStatus::InputFailure,
                "SMS timeout",
            );
            return Ok(());
        }
        match self.send_sms(&req) {
            Ok(reference) => {
                info!(req_id = req.req_id, reference, "SMS sent");
                sms::dispatch_status(self.bus.as_ref(), &req, DeliveryStatus::Sent, "SMS sent");
                Ok(())
            }
            Err(e) => {
                warn!(req_id = req.req_id, "failed to send SMS: {e}");
                let info = match &e {
                    ModemError::SmsError { code } => {
                        format!("Error sending message over GSM modem: +CMS ERROR {code}")
                    }
                    _ => "Error sending message over GSM modem".to_owned(),
                };
                self.queue.push(req.clone());
                sms::dispatch_status(self.bus.as_ref(), &req, DeliveryStatus::Error, &info);
                // A vanished port cannot be retried in-band.
                if matches!(e, ModemError::SerialGone(_)) {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// The one transaction that is not line-oriented: `+CMGS` answers with
    /// a raw 4-byte prompt before the payload may be written. The raw-mode
    /// guard is scoped so every exit path restores line discipline.
    fn send_sms(&mut self, req: &SmsRequest) -> Result<u32> {
        let deadline = Instant::now() + self.sms_timeout;
        self.at.send(&format!("+CMGS=\"{}\"", req.destination))?;
        {
            let mut raw = self.at.raw_mode();
            let prompt = raw.read_exact(SMS_PROMPT.len(), deadline)?;
            if prompt.as_slice() != SMS_PROMPT.as_slice() {
                return Err(ModemError::unexpected(format!(
                    "no SMS prompt, got {prompt:?}"
                )));
            }
        }
        let mut payload = Vec::with_capacity(req.sms_text.len() + 1);
        payload.extend_from_slice(req.sms_text.as_bytes());
        payload.push(CTRL_Z);
        self.at.write_payload(&payload)?;

        let line = self.at.read_line_by(deadline)?;
        if let Some(code) = line.strip_prefix("+CMS ERROR:") {
            return Err(ModemError::SmsError {
                code: code.trim().parse().unwrap_or(0),
            });
        }
        let reference = line
            .strip_prefix("+CMGS:")
            .and_then(|rest| rest.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                ModemError::unexpected(format!("unexpected +CMGS reply: {line:?}"))
            })?;
        self.at.expect_ok_by(deadline)?;
        Ok(reference)
    }

    /// Lists stored messages, publishes received ones (framed or plain
    /// text), then deletes what was read.
    fn check_messages(&mut self) -> Result<()> {
        self.at.send("+CMGL=\"ALL\"")?;
        let mut received = 0u32;
        loop {
            let line = self.at.read_line()?;
            if line == "OK" {
                break;
            }
            if let Some(detail) = failure_detail(&line) {
                return Err(ModemError::unexpected(detail));
            }
            let header = sms::parse_cmgl_header(&line)?;
            let body = self.at.read_line()?;
            if !header.is_received() {
                continue;
            }
            received += 1;
            match sms::classify_body(&header.origin, &body) {
                InboundBody::Framed(msg) => {
                    info!(origin = %header.origin, "dispatching framed message from SMS");
                    self.bus.dispatch(msg);
                }
                InboundBody::Text => {
                    self.bus.dispatch(HostMessage::TextMessage {
                        origin: header.origin,
                        text: body,
                    });
                }
            }
        }
        if received > 0 {
            self.at.send("+CMGD=0,3")?;
            self.at.expect_ok()?;
            debug!(received, "deleted read messages");
        }
        Ok(())
    }
}

fn classify_ping_line(line: &str) -> PingOutcome {
    if let Some(rest) = line.strip_prefix("+UUPING:") {
        if let Some(rtt) = rest
            .rsplit(',')
            .next()
            .and_then(|field| field.trim().parse::<f64>().ok())
        {
            if rtt >= 0.0 {
                return PingOutcome::Rtt(rtt);
            }
        }
        return PingOutcome::Failed;
    }
    if let Some(rest) = line.strip_prefix("+UUPINGER:") {
        if matches!(rest.trim().parse::<i64>(), Ok(17)) {
            return PingOutcome::NoProfile;
        }
    }
    PingOutcome::Failed
}

/// `+CNUM: "<alpha>","<number>",<type>`; the number is the second field.
fn parse_cnum(line: &str) -> Option<String> {
    let number = line.strip_prefix("+CNUM:")?.split(',').nth(1)?.trim();
    let number = number.strip_prefix('"')?.strip_suffix('"')?;
    (!number.is_empty()).then(|| number.to_owned())
}

/// Piecewise-linear map from the raw `+CSQ` integer to percent. Values
/// above 31 (including the "unknown" 99) clamp to the top of the scale.
pub fn rssi_to_percent(raw: i64) -> f64 {
    let r = raw.clamp(0, 31) as f64;
    if r <= 9.0 {
        r / 9.0 * 25.0
    } else if r <= 14.0 {
        25.0 + (r - 10.0) / 4.0 * 25.0
    } else if r <= 19.0 {
        50.0 + (r - 15.0) / 4.0 * 25.0
    } else {
        75.0 + (r - 20.0) / 11.0 * 25.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{exchange, Exchange, MockSerial, RecordingBus};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    fn modem_with(
        script: Vec<Exchange>,
    ) -> (
        TobyL2<MockSerial>,
        MockSerial,
        Arc<RecordingBus>,
        Arc<SmsQueue>,
    ) {
        let bus = Arc::new(RecordingBus::new());
        let queue = Arc::new(SmsQueue::new());
        let mock = MockSerial::new(script);
        let mut modem = TobyL2::new(
            mock.clone(),
            Config::default(),
            queue.clone(),
            bus.clone(),
        );
        modem.at.set_read_timeout(Duration::from_millis(20));
        modem.reset_settle = Duration::ZERO;
        (modem, mock, bus, queue)
    }

    fn boot_script() -> Vec<Exchange> {
        vec![
            exchange("AT+CFUN=16\r", "OK\r\n"),
            exchange("AT\r", "AT\r\r\nOK\r\n"),
            exchange("ATE0\r", "ATE0\r\r\nOK\r\n"),
            exchange("AT+CFUN=4\r", "OK\r\n"),
            exchange("AT+CGSN\r", "004999010640000\r\nOK\r\n"),
            exchange("AT+CMEE=2\r", "OK\r\n"),
            exchange("AT+CPIN?\r", "+CPIN: READY\r\nOK\r\n"),
            exchange("AT+CIMI\r", "262021234567890\r\nOK\r\n"),
            exchange("AT+CNUM\r", "+CNUM: \"\",\"+491701234567\",145\r\nOK\r\n"),
            exchange("AT+CGDCONT=1,\"IP\",\"web.vodafone.de\"\r", "OK\r\n"),
            exchange("AT+UCGDFLT=1,\"IP\",\"web.vodafone.de\"\r", "OK\r\n"),
            exchange("AT+CMGF=1\r", "OK\r\n"),
            exchange("AT+CSCS=\"IRA\"\r", "OK\r\n"),
            exchange("AT+CNMI=2,2\r", "OK\r\n"),
            exchange("AT+CFUN=1\r", "OK\r\n"),
        ]
    }

    fn queued(deadline_from_now: f64) -> SmsRequest {
        let deadline = if deadline_from_now >= 0.0 {
            now_since_epoch() + Duration::from_secs_f64(deadline_from_now)
        } else {
            Duration::ZERO
        };
        SmsRequest {
            deadline,
            req_id: 7,
            src_adr: 20,
            src_eid: 3,
            destination: "+491234".into(),
            sms_text: "hello".into(),
        }
    }

    #[test]
    fn bootstrap_runs_the_full_init_sequence() {
        let (mut modem, mock, _bus, _queue) = modem_with(boot_script());
        modem.bootstrap().unwrap();
        assert!(mock.finished());
        assert_eq!(modem.identity().imei, "004999010640000");
        assert_eq!(modem.identity().imsi, "262021234567890");
        assert_eq!(
            modem.identity().phone_number.as_deref(),
            Some("+491701234567")
        );
    }

    #[test]
    fn bootstrap_unlocks_a_pinned_sim() {
        let mut script = boot_script();
        script.splice(
            6..7,
            [
                exchange("AT+CPIN?\r", "+CPIN: SIM PIN\r\nOK\r\n"),
                exchange("AT+CPIN=1234\r", "OK\r\n"),
                exchange("AT+CPIN?\r", "+CPIN: READY\r\nOK\r\n"),
            ],
        );
        let bus = Arc::new(RecordingBus::new());
        let queue = Arc::new(SmsQueue::new());
        let mock = MockSerial::new(script);
        let cfg = Config {
            pin: "1234".into(),
            ..Config::default()
        };
        let mut modem = TobyL2::new(mock.clone(), cfg, queue, bus);
        modem.at.set_read_timeout(Duration::from_millis(20));
        modem.reset_settle = Duration::ZERO;

        modem.bootstrap().unwrap();
        assert!(mock.finished());
        assert_eq!(modem.identity().imsi, "262021234567890");
    }

    #[test]
    fn bootstrap_fails_on_an_unusable_sim() {
        let mut script = boot_script();
        script.truncate(6);
        script.push(exchange("AT+CPIN?\r", "+CPIN: SIM PUK\r\nOK\r\n"));
        let (mut modem, _mock, _bus, _queue) = modem_with(script);
        let err = modem.bootstrap().unwrap_err();
        assert!(matches!(
            err,
            ModemError::BootstrapFailed {
                step: "sim unlock",
                ..
            }
        ));
    }

    #[test]
    fn cold_start_reaches_online_one_step_per_tick() {
        let mut script = boot_script();
        script.extend([
            // tick 1: Initial -> SimReady
            exchange("AT+CPIN?\r", "+CPIN: READY\r\nOK\r\n"),
            // tick 2: SimReady -> Registered
            exchange("AT+CREG?\r", "+CREG: 0,1\r\nOK\r\n"),
            // tick 3: Registered -> PdpAttached (HSDPA, context inactive)
            exchange("AT+COPS?\r", "+COPS: 0,0,\"vodafone\",4\r\nOK\r\n"),
            exchange("AT+CGACT?\r", "+CGACT: 1,0\r\nOK\r\n"),
            exchange("AT+CGACT=1,1\r", "OK\r\n"),
            // tick 4: PdpAttached -> Online (SMS poll now runs first)
            exchange("AT+CMGL=\"ALL\"\r", "OK\r\n"),
            exchange("AT+CGACT?\r", "+CGACT: 1,1\r\nOK\r\n"),
            // tick 5: Online stays Online, ping succeeds
            exchange("AT+CMGL=\"ALL\"\r", "OK\r\n"),
            exchange("AT+CGACT?\r", "+CGACT: 1,1\r\nOK\r\n"),
            exchange(
                "AT+UPING=\"www.google.com\",1,32,5000,255\r",
                "OK\r\n+UUPING: 1,32,\"www.google.com\",\"172.217.23.100\",53,260\r\n",
            ),
        ]);
        let (mut modem, mock, _bus, _queue) = modem_with(script);
        modem.bootstrap().unwrap();

        let expected = [
            LinkState::SimReady,
            LinkState::Registered,
            LinkState::PdpAttached,
            LinkState::Online,
            LinkState::Online,
        ];
        for want in expected {
            modem.step_network().unwrap();
            assert_eq!(modem.state(), want);
        }
        assert!(mock.finished());
        assert!((modem.link_latency_secs() - 0.260).abs() < 1e-9);
    }

    #[test]
    fn sim_error_keeps_state_at_initial() {
        let (mut modem, _mock, _bus, _queue) = modem_with(vec![exchange(
            "AT+CPIN?\r",
            "+CME ERROR: SIM not inserted\r\n",
        )]);
        modem.step_network().unwrap();
        assert_eq!(modem.state(), LinkState::Initial);
    }

    #[test]
    fn unknown_rat_keeps_state_registered() {
        let (mut modem, _mock, _bus, _queue) = modem_with(vec![exchange(
            "AT+COPS?\r",
            "+COPS: 0,0,\"vodafone\",9\r\nOK\r\n",
        )]);
        modem.state = LinkState::Registered;
        modem.step_network().unwrap();
        assert_eq!(modem.state(), LinkState::Registered);
    }

    #[test]
    fn lte_advances_without_activating_a_context() {
        let (mut modem, mock, _bus, _queue) = modem_with(vec![exchange(
            "AT+COPS?\r",
            "+COPS: 0,0,\"vodafone\",7\r\nOK\r\n",
        )]);
        modem.state = LinkState::Registered;
        modem.step_network().unwrap();
        assert_eq!(modem.state(), LinkState::PdpAttached);
        assert!(mock.finished());
    }

    #[test]
    fn lost_context_resets_supervision() {
        let (mut modem, _mock, _bus, _queue) = modem_with(vec![
            exchange("AT+CMGL=\"ALL\"\r", "OK\r\n"),
            exchange("AT+CGACT?\r", "+CGACT: 1,0\r\nOK\r\n"),
        ]);
        modem.state = LinkState::Online;
        modem.step_network().unwrap();
        assert_eq!(modem.state(), LinkState::Initial);
    }

    fn online_tick_with_ping_reply(reply: &str) -> Vec<Exchange> {
        vec![
            exchange("AT+CMGL=\"ALL\"\r", "OK\r\n"),
            exchange("AT+CGACT?\r", "+CGACT: 1,1\r\nOK\r\n"),
            exchange(
                "AT+UPING=\"www.google.com\",1,32,5000,255\r",
                &format!("OK\r\n{reply}\r\n"),
            ),
        ]
    }

    #[test]
    fn missing_psd_profile_is_provisioned_once_per_occurrence() {
        let mut script = online_tick_with_ping_reply("+UUPINGER: 17");
        script.extend([
            exchange("AT+UPSD=0,100,1\r", "OK\r\n"),
            exchange("AT+UPSD=0,0,0\r", "OK\r\n"),
            exchange("AT+UPSDA=0,3\r", "OK\r\n"),
        ]);
        let (mut modem, mock, _bus, _queue) = modem_with(script);
        modem.state = LinkState::Online;
        modem.step_network().unwrap();
        assert_eq!(modem.state(), LinkState::Online);
        assert!(mock.finished());
    }

    #[test]
    fn ping_failures_regress_only_after_five_in_a_row() {
        let mut script = Vec::new();
        for _ in 0..5 {
            script.extend(online_tick_with_ping_reply("+UUPINGER: 4"));
        }
        let (mut modem, _mock, _bus, _queue) = modem_with(script);
        modem.state = LinkState::Online;

        for _ in 0..4 {
            modem.step_network().unwrap();
            assert_eq!(modem.state(), LinkState::Online);
        }
        modem.step_network().unwrap();
        assert_eq!(modem.state(), LinkState::Initial);
        assert_eq!(modem.ping_failures, 0);
    }

    #[test]
    fn a_successful_ping_clears_the_failure_counter() {
        let mut script = Vec::new();
        script.extend(online_tick_with_ping_reply("+UUPINGER: 4"));
        script.extend(online_tick_with_ping_reply(
            "+UUPING: 1,32,\"www.google.com\",\"172.217.23.100\",53,31",
        ));
        let (mut modem, _mock, _bus, _queue) = modem_with(script);
        modem.state = LinkState::Online;
        modem.step_network().unwrap();
        assert_eq!(modem.ping_failures, 1);
        modem.step_network().unwrap();
        assert_eq!(modem.ping_failures, 0);
        assert!((modem.link_latency_secs() - 0.031).abs() < 1e-9);
    }

    #[test]
    fn sms_send_round_trip() {
        let (mut modem, mock, bus, queue) = modem_with(vec![
            exchange("AT+CMGS=\"+491234\"\r", "\r\n> "),
            exchange("hello\x1a", "+CMGS: 1\r\nOK\r\n"),
        ]);
        queue.push(queued(30.0));
        modem.process_sms_queue().unwrap();

        assert!(mock.finished());
        assert!(queue.is_empty());
        match &bus.drain()[0] {
            HostMessage::SmsStatus { status, .. } => {
                assert_eq!(*status, DeliveryStatus::Sent);
            }
            other => panic!("expected an SmsStatus, got {other:?}"),
        }
    }

    #[test]
    fn expired_requests_are_dropped_without_touching_the_wire() {
        let (mut modem, mock, bus, queue) = modem_with(vec![]);
        queue.push(queued(-1.0));
        modem.process_sms_queue().unwrap();

        assert!(mock.finished());
        assert!(queue.is_empty());
        match &bus.drain()[0] {
            HostMessage::SmsStatus { status, info, .. } => {
                assert_eq!(*status, DeliveryStatus::InputFailure);
                assert_eq!(info, "SMS timeout");
            }
            other => panic!("expected an SmsStatus, got {other:?}"),
        }
    }

    #[test]
    fn a_missing_prompt_requeues_and_line_mode_survives() {
        // Only half the prompt arrives; the send fails, the request goes
        // back on the queue, and the next line-oriented transaction works.
        let (mut modem, _mock, bus, queue) = modem_with(vec![
            exchange("AT+CMGS=\"+491234\"\r", "\r\n"),
            exchange("AT+CSQ\r", "+CSQ: 18,99\r\nOK\r\n"),
        ]);
        modem.sms_timeout = Duration::from_millis(20);
        queue.push(queued(30.0));
        modem.process_sms_queue().unwrap();

        assert_eq!(queue.len(), 1);
        match &bus.drain()[0] {
            HostMessage::SmsStatus { status, .. } => {
                assert_eq!(*status, DeliveryStatus::Error);
            }
            other => panic!("expected an SmsStatus, got {other:?}"),
        }
        modem.query_rssi().unwrap();
    }

    #[test]
    fn cms_error_surfaces_the_code() {
        let (mut modem, _mock, bus, queue) = modem_with(vec![
            exchange("AT+CMGS=\"+491234\"\r", "\r\n> "),
            exchange("hello\x1a", "+CMS ERROR: 500\r\n"),
        ]);
        queue.push(queued(30.0));
        modem.process_sms_queue().unwrap();

        assert_eq!(queue.len(), 1);
        match &bus.drain()[0] {
            HostMessage::SmsStatus { status, info, .. } => {
                assert_eq!(*status, DeliveryStatus::Error);
                assert!(info.contains("+CMS ERROR 500"), "info was {info:?}");
            }
            other => panic!("expected an SmsStatus, got {other:?}"),
        }
    }

    #[test]
    fn queued_requests_drain_earliest_deadline_first() {
        let (mut modem, _mock, _bus, queue) = modem_with(vec![
            exchange("AT+CMGS=\"+491234\"\r", "\r\n> "),
            exchange("first\x1a", "+CMGS: 1\r\nOK\r\n"),
            exchange("AT+CMGS=\"+491234\"\r", "\r\n> "),
            exchange("second\x1a", "+CMGS: 2\r\nOK\r\n"),
        ]);
        let mut early = queued(10.0);
        early.sms_text = "first".into();
        let mut late = queued(300.0);
        late.req_id = 8;
        late.sms_text = "second".into();
        queue.push(late);
        queue.push(early);

        modem.process_sms_queue().unwrap();
        modem.process_sms_queue().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn inbound_framed_message_is_dispatched_verbatim() {
        let inner = HostMessage::TextMessage {
            origin: "control".into(),
            text: "resume mission".into(),
        };
        let body = BASE64.encode(crate::frame::encode(&inner).unwrap());
        let (mut modem, mock, bus, _queue) = modem_with(vec![
            exchange(
                "AT+CMGL=\"ALL\"\r",
                &format!("+CMGL: 1,\"REC UNREAD\",\"+491000\",,,,\r\n{body}\r\nOK\r\n"),
            ),
            exchange("AT+CMGD=0,3\r", "OK\r\n"),
        ]);
        modem.check_messages().unwrap();

        assert!(mock.finished());
        let msgs = bus.drain();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0], inner);
    }

    #[test]
    fn base64_that_is_not_a_frame_falls_back_to_text() {
        let body = BASE64.encode(b"opaque bytes");
        let (mut modem, _mock, bus, _queue) = modem_with(vec![
            exchange(
                "AT+CMGL=\"ALL\"\r",
                &format!("+CMGL: 1,\"REC UNREAD\",\"+491000\",,,,\r\n{body}\r\nOK\r\n"),
            ),
            exchange("AT+CMGD=0,3\r", "OK\r\n"),
        ]);
        modem.check_messages().unwrap();

        match &bus.drain()[0] {
            HostMessage::TextMessage { origin, text } => {
                assert_eq!(origin, "+491000");
                assert_eq!(*text, body);
            }
            other => panic!("expected a TextMessage, got {other:?}"),
        }
    }

    #[test]
    fn plain_inbound_text_is_published_with_its_origin() {
        let (mut modem, _mock, bus, _queue) = modem_with(vec![
            exchange(
                "AT+CMGL=\"ALL\"\r",
                "+CMGL: 1,\"REC READ\",\"+491000\",,,,\r\nhello back\r\nOK\r\n",
            ),
            exchange("AT+CMGD=0,3\r", "OK\r\n"),
        ]);
        modem.check_messages().unwrap();

        match &bus.drain()[0] {
            HostMessage::TextMessage { origin, text } => {
                assert_eq!(origin, "+491000");
                assert_eq!(text, "hello back");
            }
            other => panic!("expected a TextMessage, got {other:?}"),
        }
    }

    #[test]
    fn an_empty_listing_skips_the_delete() {
        let (mut modem, mock, bus, _queue) =
            modem_with(vec![exchange("AT+CMGL=\"ALL\"\r", "OK\r\n")]);
        modem.check_messages().unwrap();
        assert!(mock.finished());
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn rssi_map_matches_the_piecewise_scale() {
        let table = [
            (0, 0.0),
            (9, 25.0),
            (10, 25.0),
            (14, 50.0),
            (15, 50.0),
            (19, 75.0),
            (20, 75.0),
            (31, 100.0),
            (99, 100.0),
        ];
        for (raw, want) in table {
            let got = rssi_to_percent(raw);
            assert!((got - want).abs() < 0.01, "raw {raw}: {got} != {want}");
        }
    }

    #[test]
    fn rssi_is_only_polled_past_registration() {
        let (mut modem, mock, _bus, _queue) = modem_with(vec![exchange(
            "AT+CSQ\r",
            "+CSQ: 23,99\r\nOK\r\n",
        )]);
        modem.rssi_timer.set_top(Duration::ZERO);
        modem.ntwk_timer.set_top(Duration::from_secs(3600));

        // Below Registered the timer fires but no query goes out.
        modem.update().unwrap();
        assert!(!mock.finished());

        modem.state = LinkState::Registered;
        modem.rssi_timer.set_top(Duration::ZERO);
        modem.update().unwrap();
        assert!(mock.finished());
        assert!((modem.rssi_percent() - (75.0 + 3.0 / 11.0 * 25.0)).abs() < 0.01);
    }

    #[test]
    fn reconfigure_hot_applies_periods() {
        let (mut modem, _mock, _bus, _queue) = modem_with(vec![]);
        let new = Config {
            rssi_period: 0.0,
            ..Config::default()
        };
        assert_eq!(modem.reconfigure(&new), ReloadOutcome::Applied);
        assert!(modem.rssi_timer.overflow());
    }

    #[test]
    fn reconfigure_refuses_bootstrap_fields() {
        let (mut modem, _mock, _bus, _queue) = modem_with(vec![]);
        let new = Config {
            apn: "internet".into(),
            ..Config::default()
        };
        assert_eq!(modem.reconfigure(&new), ReloadOutcome::RestartNeeded);
    }

    #[test]
    fn a_dead_port_surfaces_serial_gone() {
        let (mut modem, mock, _bus, _queue) = modem_with(vec![exchange(
            "AT+CPIN?\r",
            "+CPIN: READY\r\nOK\r\n",
        )]);
        mock.kill();
        let err = modem.step_network().unwrap_err();
        assert!(matches!(err, ModemError::SerialGone(_)));
    }
}

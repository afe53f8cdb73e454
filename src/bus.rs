//! Host message-bus contract.
//!
//! The driver does not own a bus implementation; it dispatches
//! [`HostMessage`] values through the [`Bus`] trait and receives inbound
//! traffic through thread-safe callbacks (see [`crate::sms::SmsGateway`] and
//! [`crate::task::PowerChannelMonitor`]). The standalone daemon installs
//! [`JsonBus`], which writes one JSON object per line.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::error;

/// Everything that crosses the host bus, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostMessage {
    PowerChannelState {
        name: String,
        on: bool,
    },
    PowerChannelControl {
        name: String,
        op: PowerChannelOp,
    },
    SmsRequest {
        req_id: u16,
        destination: String,
        sms_text: String,
        /// Seconds until the request expires.
        timeout: f64,
        src_adr: u16,
        src_eid: u8,
    },
    SmsStatus {
        req_id: u16,
        dst_adr: u16,
        dst_eid: u8,
        status: DeliveryStatus,
        info: String,
    },
    TextMessage {
        origin: String,
        text: String,
    },
    Rssi {
        /// Signal strength, percent 0..100.
        value: f32,
    },
    LinkLatency {
        /// Last measured round-trip time, seconds.
        value: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Error,
    InputFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerChannelOp {
    TurnOn,
}

/// Outbound dispatch. Implementations must tolerate being called from both
/// the task thread and the host's bus thread.
pub trait Bus: Send + Sync {
    fn dispatch(&self, msg: HostMessage);
}

/// Bus implementation for the standalone daemon: one JSON object per line.
pub struct JsonBus<W> {
    out: Mutex<W>,
}

impl JsonBus<std::io::Stdout> {
    pub fn stdout() -> Self {
        JsonBus::new(std::io::stdout())
    }
}

impl<W: Write> JsonBus<W> {
    pub fn new(out: W) -> Self {
        JsonBus {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> Bus for JsonBus<W> {
    fn dispatch(&self, msg: HostMessage) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        let line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize bus message: {e}");
                return;
            }
        };
        if let Err(e) = writeln!(out, "{line}") {
            error!("failed to write bus message: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bus_emits_one_tagged_object_per_line() {
        let bus = JsonBus::new(Vec::new());
        bus.dispatch(HostMessage::Rssi { value: 75.0 });
        bus.dispatch(HostMessage::LinkLatency { value: 0.26 });
        let out = String::from_utf8(bus.out.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kind\":\"rssi\""));
        assert!(lines[1].contains("\"kind\":\"link_latency\""));
    }

    #[test]
    fn messages_survive_a_serde_round_trip() {
        let msg = HostMessage::SmsStatus {
            req_id: 7,
            dst_adr: 20,
            dst_eid: 3,
            status: DeliveryStatus::Queued,
            info: "SMS sent to queue".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<HostMessage>(&json).unwrap(), msg);
    }
}

//! Outbound SMS queue and inbound message parsing.
//!
//! Outbound requests are drained soonest-deadline-first, one send attempt
//! per supervision tick. Inbound bodies may carry a Base64-encoded binary
//! frame (see [`crate::frame`]); anything that does not decode cleanly is
//! published as plain text.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{info, warn};

use crate::bus::{Bus, DeliveryStatus, HostMessage};
use crate::error::{ModemError, Result};
use crate::frame;

/// Single-message limit for the IRA alphabet in text mode.
pub const MAX_TEXT_LEN: usize = 160;

/// A queued outbound message. Field order matters: the derived ordering is
/// deadline-first, which the queue inverts into soonest-expiring-first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SmsRequest {
    /// Expiry, as duration since the UNIX epoch.
    pub deadline: Duration,
    pub req_id: u16,
    pub src_adr: u16,
    pub src_eid: u8,
    pub destination: String,
    pub sms_text: String,
}

pub(crate) fn now_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Deadline-ordered outbound queue, shared between the host's bus thread
/// (push) and the task thread (pop).
#[derive(Default)]
pub struct SmsQueue {
    heap: Mutex<BinaryHeap<Reverse<SmsRequest>>>,
}

impl SmsQueue {
    pub fn new() -> Self {
        SmsQueue::default()
    }

    pub fn push(&self, req: SmsRequest) {
        self.heap.lock().expect("sms queue poisoned").push(Reverse(req));
    }

    /// Removes and returns the soonest-expiring request.
    pub fn pop(&self) -> Option<SmsRequest> {
        self.heap
            .lock()
            .expect("sms queue poisoned")
            .pop()
            .map(|Reverse(req)| req)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().expect("sms queue poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("sms queue poisoned").len()
    }

    /// Dropped on task restart; pending requests do not survive a modem
    /// power cycle.
    pub fn clear(&self) {
        self.heap.lock().expect("sms queue poisoned").clear();
    }
}

/// Host-side entry point for SMS submissions. Safe to call from the bus
/// thread: validation and the status report happen inline, the queue push
/// is mutex-protected.
pub struct SmsGateway {
    queue: Arc<SmsQueue>,
    bus: Arc<dyn Bus>,
}

impl SmsGateway {
    pub fn new(queue: Arc<SmsQueue>, bus: Arc<dyn Bus>) -> Self {
        SmsGateway { queue, bus }
    }

    pub fn submit(
        &self,
        req_id: u16,
        src_adr: u16,
        src_eid: u8,
        destination: &str,
        sms_text: &str,
        timeout: f64,
    ) {
        let req = SmsRequest {
            deadline: Duration::ZERO,
            req_id,
            src_adr,
            src_eid,
            destination: destination.to_owned(),
            sms_text: sms_text.to_owned(),
        };
        if timeout <= 0.0 {
            info!(req_id, "rejecting SMS request with zero timeout");
            dispatch_status(
                self.bus.as_ref(),
                &req,
                DeliveryStatus::InputFailure,
                "SMS timeout cannot be zero",
            );
            return;
        }
        if sms_text.len() > MAX_TEXT_LEN {
            info!(req_id, len = sms_text.len(), "rejecting over-length SMS");
            dispatch_status(
                self.bus.as_ref(),
                &req,
                DeliveryStatus::InputFailure,
                "Can only send 160 characters over SMS",
            );
            return;
        }
        let req = SmsRequest {
            deadline: now_since_epoch() + Duration::from_secs_f64(timeout),
            ..req
        };
        self.queue.push(req.clone());
        dispatch_status(
            self.bus.as_ref(),
            &req,
            DeliveryStatus::Queued,
            "SMS sent to queue",
        );
    }
}

/// Reports delivery progress back to the requester.
pub(crate) fn dispatch_status(
    bus: &dyn Bus,
    req: &SmsRequest,
    status: DeliveryStatus,
    info: &str,
) {
    bus.dispatch(HostMessage::SmsStatus {
        req_id: req.req_id,
        dst_adr: req.src_adr,
        dst_eid: req.src_eid,
        status,
        info: info.to_owned(),
    });
}

/// One `+CMGL:` header row from the stored-message listing.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StoredSmsHeader {
    pub stat: String,
    pub origin: String,
}

impl StoredSmsHeader {
    /// Received messages count toward the post-listing `+CMGD` cleanup;
    /// stored drafts and sent copies do not.
    pub fn is_received(&self) -> bool {
        self.stat == "REC UNREAD" || self.stat == "REC READ"
    }
}

/// Splits `+CMGL: <idx>,<stat>,"<from>",...` into its interesting fields.
/// The origin must be quote-delimited; a bare empty field means the line is
/// not a listing header at all.
pub(crate) fn parse_cmgl_header(line: &str) -> Result<StoredSmsHeader> {
    let rest = line
        .strip_prefix("+CMGL:")
        .ok_or_else(|| ModemError::unexpected(format!("not a +CMGL header: {line:?}")))?;
    let parts: Vec<&str> = rest.split(',').collect();
    if parts.len() < 3 {
        return Err(ModemError::unexpected(format!(
            "short +CMGL header: {line:?}"
        )));
    }
    let stat = unquote(parts[1].trim()).ok_or_else(|| {
        ModemError::unexpected(format!("unquoted message state in {line:?}"))
    })?;
    let origin = unquote(parts[2].trim()).ok_or_else(|| {
        ModemError::unexpected(format!("unquoted origin in {line:?}"))
    })?;
    Ok(StoredSmsHeader {
        stat: stat.to_owned(),
        origin: origin.to_owned(),
    })
}

fn unquote(field: &str) -> Option<&str> {
    field
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
}

/// What an inbound SMS body turned out to contain.
#[derive(Debug)]
pub(crate) enum InboundBody {
    /// A valid Base64-encoded frame; the decoded message is dispatched to
    /// the host bus verbatim.
    Framed(HostMessage),
    /// Anything else is plain text.
    Text,
}

/// Base64 auto-detection with plain-text fallback. A body that decodes as
/// Base64 but fails frame validation is demoted to text with a warning; a
/// body that is not Base64 at all is text without ceremony.
pub(crate) fn classify_body(origin: &str, body: &str) -> InboundBody {
    let Ok(bytes) = BASE64.decode(body.trim()) else {
        return InboundBody::Text;
    };
    match frame::decode(&bytes) {
        Ok(msg) => InboundBody::Framed(msg),
        Err(e) => {
            warn!(origin, "inbound SMS looked like Base64 but is not a frame: {e}");
            InboundBody::Text
        }
    }
}

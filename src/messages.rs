//! Queue message types (spec §2, §6): the opaque command/response queues
//! the surrounding runtime supplies, and the backend-command/broker-sink
//! shapes the core produces. None of these types know how to move bytes on
//! the wire themselves — that's the out-of-scope USB backend.

use crate::stream::reassembly::ReassembledBuffer;

/// Requested open mode (spec §6 `!open`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Normal,
    Raw,
}

/// A reset target for `h/!reset` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    App,
    Update1,
    Update2,
}

/// Inbound command queue messages: topic/value traffic from the
/// application, already stripped of the device prefix (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(OpenMode),
    Close,
    Finalize,
    Reset(ResetTarget),
    /// A bare topic publish, forwarded as pubsub unless it matches one of
    /// the reserved prefixes the event loop special-cases (spec §4.5).
    /// `value_type` is the pubsub type tag (spec §3 "Service payloads");
    /// ignored for the reserved memory-op/link topics.
    Topic {
        topic: String,
        value_type: u8,
        value: Vec<u8>,
    },
}

/// Inbound response queue messages: replies and asynchronous events from
/// the lower-level USB backend (spec §2, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    BackendOpenAck,
    BackendOpenNack,
    BackendBulkAck,
    BackendBulkNack,
    BackendCloseAck,
    /// Raw bytes read from the bulk-in pipe: one complete wire frame (or,
    /// for the older device, a legacy stream frame prefixed with the
    /// packed header described in spec §3 "Stream frame").
    StreamInData(Vec<u8>),
    /// A bulk-out transfer the backend has finished with; the buffer is
    /// returned for reuse (spec §5 "Driver event loop" step 3).
    BulkOutDataComplete,
    /// The backend's belief about physical device presence has changed.
    PresenceChanged(bool),
}

/// Commands the core issues to the (out-of-scope) backend to drive USB.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    Open,
    BulkInStreamOpen,
    Close,
    /// Write one already-framed byte buffer out the bulk-out pipe.
    Send(Vec<u8>),
}

/// Messages published to the application-facing broker (spec §6 "Broker
/// emissions").
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMessage {
    /// `h/state` — the connection state machine's current [`crate::state_machine::State`],
    /// encoded as its spec-ordinal u32.
    State(u32),
    /// `!open#` / `!close#` status report (0 = ok, 1 = fail).
    OpenStatus(u8),
    CloseStatus(u8),
    /// `h/link/!pong` binary reply to a ping.
    Pong(Vec<u8>),
    /// A pubsub value decoded from the device, echoed back onto the topic
    /// it arrived on (spec §6 "on-device pubsub publishes are echoed back").
    PubSubEcho {
        topic: String,
        value_type: u8,
        value: Vec<u8>,
    },
    /// `!rdata` binary result from a memory-op read.
    MemReadData { topic: String, data: Vec<u8> },
    /// The `#`-suffixed return-code message terminating a memory op.
    MemReturnCode { topic: String, status: u8 },
    /// A reassembled sample buffer ready for a per-port data topic.
    Samples {
        topic: &'static str,
        buffer: ReassembledBuffer,
    },
}

//! Driver event loop (C5, spec §4.5) and its owning per-device thread.
//!
//! Single-threaded cooperative loop: multiplexes the inbound command and
//! response queues, dispatches into the frame codec (C1), connection state
//! machine (C4), memory-op coordinator (C6), and — for the streaming
//! device generation — the decompressor/combiner/reassembly pipeline
//! (C2/C3/C7), then drives the backend-command and broker-sink outputs.
//!
//! Spawned exactly the way the teacher's `GsUsbDriver::open` spawns its
//! `UsbEventLoop`: a dedicated OS thread running a current-thread tokio
//! runtime over an async `run()` built on `tokio::select!`, wrapped in
//! `catch_unwind` so a panic on the device thread can't silently vanish.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{DeviceGeneration, DriverConfig};
use crate::error::DriverError;
use crate::frame::{Decoded, FrameCodec, LinkControlSubtype, ServiceType};
use crate::frontpanel::FrontPanelCombiner;
use crate::memory_op::{self, Completion, MemoryOpCoordinator, OutFrame};
use crate::messages::{BackendCommand, BrokerMessage, Command, OpenMode, Response};
use crate::pubsub;
use crate::state_machine::{Action, ConnectionStateMachine, Event, Presence, State, StateTimeouts};
use crate::stream::decode_port_payload;
use crate::stream::port_map::PortMap;
use crate::stream::reassembly::PortReassembly;
use crate::stream::StreamFrameHeader;
use crate::suppressor::Suppressor;

/// Link-service `msg_type`, carried in `metadata[7:0]` (spec §3).
mod link_msg_type {
    pub const STATUS: u8 = 0;
    pub const TIMESYNC_REQ: u8 = 1;
    pub const TIMESYNC_RSP: u8 = 2;
    pub const PING: u8 = 3;
    pub const PONG: u8 = 4;
}

/// Sentinel used to drain the device's pubsub queue during graceful close
/// (spec §4.4 "pubsub-flush" entry action).
const PUBSUB_FLUSH_TOPIC: &str = "././!ping";
const PUBSUB_FLUSH_VALUE: &[u8] = b"h|disconnect";

/// Handle returned by [`Driver::spawn`]: the channel ends the embedding
/// runtime uses to feed the device thread and to request shutdown.
pub struct DriverHandle {
    pub commands: mpsc::Sender<Command>,
    pub responses: mpsc::Sender<Response>,
    pub finalize_pending: Arc<AtomicBool>,
    pub join: std::thread::JoinHandle<()>,
}

/// Per-port streaming state, only populated for [`DeviceGeneration::Streaming`].
#[derive(Default)]
struct StreamingState {
    reassembly: HashMap<u16, PortReassembly>,
    combiner: Option<FrontPanelCombiner>,
}

pub struct Driver {
    config: DriverConfig,
    sm: ConnectionStateMachine,
    codec: FrameCodec,
    mem: MemoryOpCoordinator,
    streaming: StreamingState,
    presence: Presence,
    finalize_pending: Arc<AtomicBool>,
    backend_tx: mpsc::Sender<BackendCommand>,
    broker_tx: mpsc::Sender<BrokerMessage>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        backend_tx: mpsc::Sender<BackendCommand>,
        broker_tx: mpsc::Sender<BrokerMessage>,
        finalize_pending: Arc<AtomicBool>,
    ) -> Self {
        let timeouts = StateTimeouts {
            pubsub_flush: config.pubsub_flush_timeout,
            link_disconnect: config.link_disconnect_timeout,
            ll_close_pend: config.ll_close_pend_timeout,
        };
        let streaming = match config.generation {
            DeviceGeneration::Streaming => {
                let suppressor = Suppressor::new(
                    config.suppressor.mode,
                    config.suppressor.pre,
                    config.suppressor.post,
                    crate::suppressor::aggressive_matrix(),
                );
                StreamingState {
                    reassembly: HashMap::new(),
                    combiner: Some(FrontPanelCombiner::new(suppressor)),
                }
            }
            DeviceGeneration::Framed => StreamingState::default(),
        };
        Driver {
            // Leave room for the 1-byte op tag + 4-byte offset the mem-op
            // wire framing (see `encode_mem_frame`) prefixes onto each
            // write-data chunk.
            mem: MemoryOpCoordinator::new(
                crate::frame::MAX_PAYLOAD_BYTES - 5,
                config.memory_write_buffer_size,
            ),
            sm: ConnectionStateMachine::new(timeouts),
            codec: FrameCodec::new(),
            streaming,
            presence: Presence::Present,
            config,
            finalize_pending,
            backend_tx,
            broker_tx,
        }
    }

    /// Spawn the device driver on its own OS thread (spec §5 "each device
    /// runs on its own worker thread").
    pub fn spawn(
        config: DriverConfig,
        backend_tx: mpsc::Sender<BackendCommand>,
        broker_tx: mpsc::Sender<BrokerMessage>,
    ) -> DriverHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (resp_tx, resp_rx) = mpsc::channel(256);
        let finalize_pending = Arc::new(AtomicBool::new(false));
        let finalize_pending_thread = finalize_pending.clone();

        let join = std::thread::Builder::new()
            .name("pmu-driver".into())
            .spawn(move || {
                let _ = catch_unwind(AssertUnwindSafe(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("tokio runtime");
                    let driver = Driver::new(config, backend_tx, broker_tx, finalize_pending_thread);
                    runtime.block_on(driver.run(cmd_rx, resp_rx));
                }));
            })
            .expect("spawn device driver thread");

        DriverHandle {
            commands: cmd_tx,
            responses: resp_tx,
            finalize_pending,
            join,
        }
    }

    /// The event loop (spec §4.5): blocks on "either queue non-empty" up to
    /// a 5s ceiling, drains both queues in enqueue order, and exits once
    /// the state machine reaches `Finalized`.
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut resp_rx: mpsc::Receiver<Response>) {
        loop {
            if self.finalize_pending.load(Ordering::Acquire) && self.sm.state() != State::Finalized {
                self.dispatch_command(Command::Finalize).await;
            }

            let woke = tokio::select! {
                biased;
                Some(cmd) = cmd_rx.recv() => {
                    self.dispatch_command(cmd).await;
                    true
                }
                Some(resp) = resp_rx.recv() => {
                    self.dispatch_response(resp).await;
                    true
                }
                _ = tokio::time::sleep(self.config.queue_wait_ceiling) => false,
            };

            if !woke {
                let actions = self.sm.poll_timeout(std::time::Instant::now());
                self.run_actions(actions).await;
            }

            if self.sm.state() == State::LlClosePend {
                let actions = self.sm.apply(Event::Advance, self.presence);
                self.run_actions(actions).await;
            }

            if self.sm.state() == State::Finalized {
                log::info!("device driver thread exiting (finalized)");
                return;
            }
        }
    }

    async fn dispatch_command(&mut self, command: Command) {
        match command {
            Command::Open(mode) => {
                log::debug!("api-open requested (mode={mode:?})");
                let actions = self.sm.apply(Event::ApiOpen, self.presence);
                self.run_actions(actions).await;
            }
            Command::Close => {
                let actions = self.sm.apply(Event::ApiClose, self.presence);
                self.run_actions(actions).await;
            }
            Command::Finalize => {
                self.finalize_pending.store(true, Ordering::Release);
                let actions = self.sm.apply(Event::ApiFinalize, self.presence);
                self.run_actions(actions).await;
            }
            Command::Reset(target) => {
                // §9 open question (b): the older device does not gate
                // publishes on `state == open`; this core follows that
                // precedent rather than silently dropping resets issued
                // before the handshake completes (decision in DESIGN.md).
                let value = match target {
                    crate::messages::ResetTarget::App => b"app".to_vec(),
                    crate::messages::ResetTarget::Update1 => b"update1".to_vec(),
                    crate::messages::ResetTarget::Update2 => b"update2".to_vec(),
                };
                self.publish_pubsub("h/!reset", 0x20, &value).await;
            }
            Command::Topic {
                topic,
                value_type,
                value,
            } => {
                self.route_outbound_topic(&topic, value_type, &value).await;
            }
        }
    }

    async fn route_outbound_topic(&mut self, topic: &str, value_type: u8, value: &[u8]) {
        if topic.starts_with("h/mem/") {
            match memory_op::parse_request(topic) {
                Ok(req) => self.dispatch_memory_op(req, value).await,
                Err(err) => log::warn!("memory-op topic {topic:?} rejected: {err}"),
            }
            return;
        }

        if topic == "h/link/!ping" {
            self.send_link_frame(link_msg_type::PING, value).await;
            return;
        }

        self.publish_pubsub(topic, value_type, value).await;
    }

    async fn dispatch_memory_op(&mut self, req: memory_op::MemRequest, value: &[u8]) {
        use memory_op::Verb;
        let result = match req.verb {
            Verb::Erase => Ok(self.mem.start_erase(&req)),
            Verb::Write => self.mem.start_write(&req, value.to_vec()),
            Verb::Read => {
                let len = if value.len() >= 4 {
                    Some(u32::from_le_bytes(value[..4].try_into().unwrap()) as usize)
                } else {
                    None
                };
                self.mem.start_read(&req, len)
            }
        };
        match result {
            Ok((aborted, frame)) => {
                if let Some(completion) = aborted {
                    self.publish_completion(completion).await;
                }
                self.send_mem_frame(frame).await;
            }
            Err(DriverError::TooBig { requested, limit }) => {
                self.publish_completion(Completion::ReturnCode {
                    topic: req.return_topic,
                    status: 1,
                })
                .await;
                log::warn!("memory-op request too big: {requested} > {limit}");
            }
            Err(err) => log::warn!("memory-op request failed: {err}"),
        }
    }

    async fn send_mem_frame(&mut self, frame: OutFrame) {
        // Memory-op frames ride on port 3 of the legacy stream-frame
        // header for the streaming generation, and as pubsub-style control
        // publishes for the framed generation (DESIGN.md "mem-op framing").
        let payload = encode_mem_frame(&frame);
        match self.config.generation {
            DeviceGeneration::Streaming => {
                let header = StreamFrameHeader {
                    frame_id: self.codec.next_out_frame_id(),
                    port_id: 3,
                    payload_len: payload.len() as u16,
                };
                let mut bytes = header.encode().to_vec();
                bytes.extend_from_slice(&payload);
                self.send_backend(BackendCommand::Send(bytes)).await;
            }
            DeviceGeneration::Framed => {
                let words = pack_words(&payload);
                match self.codec.encode_data(ServiceType::Throughput, 0x0003, &words) {
                    Ok(bytes) => self.send_backend(BackendCommand::Send(bytes)).await,
                    Err(err) => log::warn!("failed to encode memory-op frame: {err}"),
                }
            }
        }
    }

    async fn publish_pubsub(&mut self, topic: &str, value_type: u8, value: &[u8]) {
        match pubsub::encode_publish(topic, value_type, value) {
            Ok((metadata, words)) => match self.codec.encode_data(ServiceType::PubSub, metadata, &words) {
                Ok(bytes) => self.send_backend(BackendCommand::Send(bytes)).await,
                Err(err) => log::warn!("failed to encode pubsub frame for {topic:?}: {err}"),
            },
            Err(err) => log::warn!("failed to encode pubsub value for {topic:?}: {err}"),
        }
    }

    async fn send_link_frame(&mut self, msg_type: u8, payload: &[u8]) {
        let words = pack_words(payload);
        match self.codec.encode_data(ServiceType::Link, msg_type as u16, &words) {
            Ok(bytes) => self.send_backend(BackendCommand::Send(bytes)).await,
            Err(err) => log::warn!("failed to encode link frame: {err}"),
        }
    }

    async fn dispatch_response(&mut self, response: Response) {
        match response {
            Response::BackendOpenAck => self.apply_sm(Event::BackendOpenAck).await,
            Response::BackendOpenNack => self.apply_sm(Event::BackendOpenNack).await,
            Response::BackendBulkAck => self.apply_sm(Event::BackendBulkAck).await,
            Response::BackendBulkNack => self.apply_sm(Event::BackendBulkNack).await,
            Response::BackendCloseAck => self.apply_sm(Event::BackendCloseAck).await,
            Response::BulkOutDataComplete => {}
            Response::PresenceChanged(present) => {
                self.presence = if present { Presence::Present } else { Presence::Absent };
                self.apply_sm(Event::Reset).await;
            }
            Response::StreamInData(bytes) => self.handle_stream_in_data(&bytes).await,
        }
    }

    async fn apply_sm(&mut self, event: Event) {
        let actions = self.sm.apply(event, self.presence);
        self.run_actions(actions).await;
    }

    async fn run_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BackendOpen => self.send_backend(BackendCommand::Open).await,
                Action::BackendBulkInStreamOpen => {
                    self.send_backend(BackendCommand::BulkInStreamOpen).await
                }
                Action::SendControlResetRequest => {
                    let bytes = self.codec.encode_control(LinkControlSubtype::ResetRequest);
                    self.send_backend(BackendCommand::Send(bytes)).await;
                }
                Action::SendControlResetAck => {
                    let bytes = self.codec.encode_control(LinkControlSubtype::ResetAck);
                    self.send_backend(BackendCommand::Send(bytes)).await;
                }
                Action::PublishPubsubFlushSentinel => {
                    self.publish_pubsub(PUBSUB_FLUSH_TOPIC, 0x20, PUBSUB_FLUSH_VALUE).await;
                }
                Action::SendControlDisconnectRequest => {
                    let bytes = self.codec.encode_control(LinkControlSubtype::DisconnectRequest);
                    self.send_backend(BackendCommand::Send(bytes)).await;
                }
                Action::BackendClose => self.send_backend(BackendCommand::Close).await,
                Action::ReportOpenStatus(status) => {
                    self.publish_broker(BrokerMessage::OpenStatus(status)).await;
                    self.publish_broker(BrokerMessage::State(self.sm.state().as_u32())).await;
                }
                Action::ReportCloseStatus(status) => {
                    self.publish_broker(BrokerMessage::CloseStatus(status)).await;
                    self.publish_broker(BrokerMessage::State(self.sm.state().as_u32())).await;
                }
            }
        }
    }

    async fn handle_stream_in_data(&mut self, bytes: &[u8]) {
        match self.codec.decode(bytes) {
            Ok(decoded @ Decoded::Control { id_field, .. }) => {
                if let Some(subtype) = decoded.as_link_control_subtype() {
                    self.handle_link_control(subtype).await;
                } else {
                    log::trace!("ack/nack control frame, id_field={id_field}");
                }
            }
            Ok(Decoded::Data {
                service,
                metadata,
                payload,
                gap: _,
            }) => match service {
                ServiceType::Link => self.handle_link_service(metadata, payload).await,
                ServiceType::PubSub => self.handle_pubsub_service(metadata, payload).await,
                ServiceType::Throughput => self.handle_throughput_service(payload).await,
                ServiceType::Trace => log::trace!("trace service payload, {} bytes", payload.len()),
                ServiceType::Invalid => log::warn!("invalid-service frame received"),
            },
            Err(err) => log::warn!("frame decode error, skipping: {err}"),
        }
    }

    async fn handle_link_control(&mut self, subtype: LinkControlSubtype) {
        let event = match subtype {
            LinkControlSubtype::ResetRequest => Event::LinkResetReq,
            LinkControlSubtype::ResetAck => Event::LinkResetAck,
            LinkControlSubtype::DisconnectRequest => Event::LinkDisconnectReq,
            LinkControlSubtype::DisconnectAck => Event::LinkDisconnectAck,
        };
        self.apply_sm(event).await;
    }

    async fn handle_link_service(&mut self, metadata: u16, payload: &[u8]) {
        let msg_type = (metadata & 0xFF) as u8;
        match msg_type {
            link_msg_type::PONG => {
                self.publish_broker(BrokerMessage::Pong(payload.to_vec())).await;
            }
            link_msg_type::PING => {
                self.send_link_frame(link_msg_type::PONG, payload).await;
            }
            link_msg_type::STATUS | link_msg_type::TIMESYNC_REQ | link_msg_type::TIMESYNC_RSP => {
                log::trace!("link service msg_type={msg_type} payload_len={}", payload.len());
            }
            other => log::warn!("unknown link msg_type={other}"),
        }
    }

    async fn handle_pubsub_service(&mut self, metadata: u16, payload: &[u8]) {
        let msg = match pubsub::decode_publish(metadata, payload) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("malformed pubsub payload: {err}");
                return;
            }
        };

        if self.sm.state() == State::PubsubFlush
            && msg.topic.eq_ignore_ascii_case(PUBSUB_FLUSH_TOPIC)
            && msg.value.eq_ignore_ascii_case(PUBSUB_FLUSH_VALUE)
        {
            self.apply_sm(Event::PubsubFlushAck).await;
            return;
        }

        self.publish_broker(BrokerMessage::PubSubEcho {
            topic: msg.topic,
            value_type: msg.value_type,
            value: msg.value,
        })
        .await;
    }

    async fn handle_throughput_service(&mut self, payload: &[u8]) {
        if self.config.generation != DeviceGeneration::Streaming {
            log::trace!("throughput payload on a framed-generation device, ignoring");
            return;
        }
        let (header, port_payload) = match StreamFrameHeader::decode(payload) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("stream-frame header decode failed: {err}");
                return;
            }
        };

        if header.port_id == 3 {
            self.handle_mem_ack(port_payload).await;
            return;
        }
        if header.port_id < 4 {
            log::trace!("control port {} stream frame ignored", header.port_id);
            return;
        }

        let Some(port) = PortMap::lookup(header.port_id) else {
            log::warn!("unknown data port {}", header.port_id);
            return;
        };
        let (sample_id, samples) = match decode_port_payload(port_payload, port) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("stream decode failed on port {}: {err}", header.port_id);
                return;
            }
        };

        if crate::frontpanel::Role::from_port_id(header.port_id).is_some() {
            if let Some(combiner) = self.streaming.combiner.as_mut() {
                combiner.ingest(header.port_id, sample_id, &samples);
                let drained = combiner.drain();
                for (drained_port, drained_id, drained_samples) in drained {
                    self.emit_reassembled(drained_port, drained_id, drained_samples);
                }
            }
        } else {
            self.emit_reassembled(header.port_id, sample_id, samples);
        }
    }

    fn emit_reassembled(&mut self, port_id: u16, sample_id: u32, samples: crate::stream::DecodedSamples) {
        let Some(port) = PortMap::lookup(port_id) else {
            return;
        };
        let entry = self.streaming.reassembly.entry(port_id).or_default();
        let buffers = entry.ingest(port, sample_id, samples);
        for buffer in buffers {
            let topic = port.data_topic;
            if topic.is_empty() {
                continue;
            }
            let tx = self.broker_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(BrokerMessage::Samples { topic, buffer }).await;
            });
        }
    }

    async fn handle_mem_ack(&mut self, payload: &[u8]) {
        let Some(&op_byte) = payload.first() else {
            return;
        };
        match op_byte {
            0 => {
                if let Some(completion) = self.mem.on_erase_ack() {
                    self.publish_completion(completion).await;
                }
            }
            1 => {
                let frames = self.mem.on_write_start_ack();
                for frame in frames {
                    self.send_mem_frame(frame).await;
                }
            }
            2 => {
                if payload.len() >= 5 {
                    let offset = u32::from_le_bytes(payload[1..5].try_into().unwrap());
                    match self.mem.on_write_data_ack(offset) {
                        Ok(frames) => {
                            for frame in frames {
                                self.send_mem_frame(frame).await;
                            }
                        }
                        Err(err) => log::error!("memory-op write out of sequence: {err}"),
                    }
                }
            }
            3 => {
                if let Some(completion) = self.mem.on_write_finalize_ack() {
                    self.publish_completion(completion).await;
                }
            }
            4 => self.mem.on_read_req_ack(),
            5 => {
                if payload.len() >= 5 {
                    let offset = u32::from_le_bytes(payload[1..5].try_into().unwrap());
                    self.mem.on_read_data(offset, &payload[5..]);
                }
            }
            6 => {
                if let Some([rdata, code]) = self.mem.on_read_terminating_ack() {
                    self.publish_completion(rdata).await;
                    self.publish_completion(code).await;
                }
            }
            other => log::warn!("unknown memory-op ack byte {other}"),
        }
    }

    async fn publish_completion(&mut self, completion: Completion) {
        let msg = match completion {
            Completion::ReadData { topic, data } => BrokerMessage::MemReadData { topic, data },
            Completion::ReturnCode { topic, status } => BrokerMessage::MemReturnCode { topic, status },
        };
        self.publish_broker(msg).await;
    }

    async fn send_backend(&mut self, command: BackendCommand) {
        if self.backend_tx.send(command).await.is_err() {
            log::error!("backend command queue closed");
        }
    }

    async fn publish_broker(&mut self, message: BrokerMessage) {
        if self.broker_tx.send(message).await.is_err() {
            log::error!("broker sink closed");
        }
    }
}

fn pack_words(bytes: &[u8]) -> Vec<u32> {
    let mut padded = bytes.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    if padded.is_empty() {
        padded.push(0);
    }
    padded
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Encode one [`OutFrame`] into the op-tagged byte payload carried on
/// port 3 / the memory-op control topic (spec §4.6). Layout: a 1-byte op
/// tag (matching [`Driver::handle_mem_ack`]'s dispatch) followed by the
/// op-specific fields.
fn encode_mem_frame(frame: &OutFrame) -> Vec<u8> {
    let mut out = Vec::new();
    match frame {
        OutFrame::Erase { region_id } => {
            out.push(0);
            out.push(*region_id);
        }
        OutFrame::WriteStart { region_id, total_len } => {
            out.push(1);
            out.push(*region_id);
            out.extend_from_slice(&total_len.to_le_bytes());
        }
        OutFrame::WriteData { offset, chunk } => {
            out.push(2);
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(chunk);
        }
        OutFrame::WriteFinalize => out.push(3),
        OutFrame::ReadReq { region_id, len } => {
            out.push(4);
            out.push(*region_id);
            out.extend_from_slice(&len.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;

    #[tokio::test(flavor = "current_thread")]
    async fn open_handshake_emits_expected_backend_and_control_sequence() {
        let (backend_tx, mut backend_rx) = mpsc::channel(16);
        let (broker_tx, mut broker_rx) = mpsc::channel(16);
        let finalize_pending = Arc::new(AtomicBool::new(false));
        let mut driver = Driver::new(DriverConfig::default(), backend_tx, broker_tx, finalize_pending);

        driver.dispatch_command(Command::Open(OpenMode::Normal)).await;
        assert!(matches!(backend_rx.recv().await, Some(BackendCommand::Open)));

        driver.dispatch_response(Response::BackendOpenAck).await;
        assert!(matches!(
            backend_rx.recv().await,
            Some(BackendCommand::BulkInStreamOpen)
        ));

        driver.dispatch_response(Response::BackendBulkAck).await;
        match backend_rx.recv().await {
            Some(BackendCommand::Send(bytes)) => {
                assert_eq!(bytes[0], crate::frame::SOF1);
                assert_eq!(bytes[1], 0x00);
                assert_eq!(bytes[2], 0x00); // reset-request subtype
            }
            other => panic!("expected control frame, got {other:?}"),
        }

        let mut reset_ack_codec = FrameCodec::new();
        let reset_ack_bytes = reset_ack_codec.encode_control(LinkControlSubtype::ResetAck);
        driver
            .dispatch_response(Response::StreamInData(reset_ack_bytes))
            .await;

        assert!(matches!(
            broker_rx.recv().await,
            Some(BrokerMessage::OpenStatus(0))
        ));
        assert_eq!(driver.sm.state(), State::Open);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn non_reserved_topic_is_forwarded_as_a_pubsub_publish() {
        let (backend_tx, mut backend_rx) = mpsc::channel(16);
        let (broker_tx, _broker_rx) = mpsc::channel(16);
        let finalize_pending = Arc::new(AtomicBool::new(false));
        let mut driver = Driver::new(DriverConfig::default(), backend_tx, broker_tx, finalize_pending);

        driver
            .dispatch_command(Command::Topic {
                topic: "s/i/ctrl".to_string(),
                value_type: 0x20,
                value: b"true\0".to_vec(),
            })
            .await;

        match backend_rx.recv().await {
            Some(BackendCommand::Send(bytes)) => {
                assert_eq!(bytes[0], crate::frame::SOF1);
                assert_eq!(bytes[1] & 0x0F, 3); // ServiceType::PubSub nibble
            }
            other => panic!("expected a pubsub data frame, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_op_topic_is_dispatched_to_the_coordinator_instead_of_pubsub() {
        let (backend_tx, mut backend_rx) = mpsc::channel(16);
        let (broker_tx, _broker_rx) = mpsc::channel(16);
        let finalize_pending = Arc::new(AtomicBool::new(false));
        let mut driver = Driver::new(DriverConfig::default(), backend_tx, broker_tx, finalize_pending);

        driver
            .dispatch_command(Command::Topic {
                topic: "h/mem/c/app/!erase".to_string(),
                value_type: 0,
                value: Vec::new(),
            })
            .await;

        assert!(driver.mem.busy());
        match backend_rx.recv().await {
            Some(BackendCommand::Send(_)) => {}
            other => panic!("expected the erase command to be sent, got {other:?}"),
        }
    }
}

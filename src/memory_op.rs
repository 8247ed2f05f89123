//! Memory-op coordinator (C6, spec §3 "Memory-op coordinator", §4.6).
//!
//! Windowed read/write of on-device regions over port 3. Only one operation
//! runs per device at a time; a new request aborts whatever is in flight.

use crate::error::{DriverError, Result};

/// Default read length when a `!read` request doesn't specify one.
pub const DEFAULT_READ_LEN: usize = 512 * 1024;
/// Hard ceiling on a single memory operation's total length.
pub const MAX_OP_LEN: usize = 512 * 1024;

/// Controller memory regions, in the order the spec's region table lists
/// them (index doubles as the on-wire region id).
pub const CONTROLLER_REGIONS: &[&str] = &[
    "app", "upd1", "upd2", "storage", "log", "acfg", "bcfg", "pers",
];
/// Sensor memory regions.
pub const SENSOR_REGIONS: &[&str] = &["app1", "app2", "cal_t", "cal_a", "cal_f", "pers"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Controller,
    Sensor,
}

/// Verb parsed from the `h/mem/{c|s}/{region}/{!erase|!write|!read}` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Erase,
    Write,
    Read,
}

/// A parsed memory-op request, resolved against the region tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRequest {
    pub target: Target,
    pub region_id: u8,
    pub region: &'static str,
    pub verb: Verb,
    pub return_topic: String,
}

/// Parse and resolve `h/mem/{c|s}/{region}/{verb}` (device-prefix already
/// stripped). Returns `ParameterInvalid` for any unresolvable component,
/// per spec §4.6 "Parameter errors return immediately".
pub fn parse_request(topic: &str) -> Result<MemRequest> {
    let mut parts = topic.split('/');
    let head = parts.next();
    if head != Some("h") {
        return Err(DriverError::ParameterInvalid(format!(
            "not a memory-op topic: {topic:?}"
        )));
    }
    if parts.next() != Some("mem") {
        return Err(DriverError::ParameterInvalid(format!(
            "not a memory-op topic: {topic:?}"
        )));
    }
    let target = match parts.next() {
        Some("c") => Target::Controller,
        Some("s") => Target::Sensor,
        other => {
            return Err(DriverError::ParameterInvalid(format!(
                "unknown memory-op target: {other:?}"
            )));
        }
    };
    let region_name = parts
        .next()
        .ok_or_else(|| DriverError::ParameterInvalid("missing memory region".to_string()))?;
    let table = match target {
        Target::Controller => CONTROLLER_REGIONS,
        Target::Sensor => SENSOR_REGIONS,
    };
    let (region_id, region) = table
        .iter()
        .enumerate()
        .find(|(_, &name)| name == region_name)
        .map(|(id, &name)| (id as u8, name))
        .ok_or_else(|| {
            DriverError::ParameterInvalid(format!("unknown memory region: {region_name:?}"))
        })?;

    let verb = match parts.next() {
        Some("!erase") => Verb::Erase,
        Some("!write") => Verb::Write,
        Some("!read") => Verb::Read,
        other => {
            return Err(DriverError::ParameterInvalid(format!(
                "unknown memory-op verb: {other:?}"
            )));
        }
    };

    Ok(MemRequest {
        target,
        region_id,
        region,
        verb,
        return_topic: format!("{topic}#"),
    })
}

/// Operation currently running in the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Erase,
    WriteStart,
    WriteData,
    WriteFinalize,
    ReadReq,
    ReadData,
}

/// Outbound frame the coordinator wants the event loop to send on port 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Erase { region_id: u8 },
    WriteStart { region_id: u8, total_len: u32 },
    WriteData { offset: u32, chunk: Vec<u8> },
    WriteFinalize,
    ReadReq { region_id: u8, len: u32 },
}

/// Result handed back to the event loop to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// `!rdata` binary payload followed by the `#` return code.
    ReadData { topic: String, data: Vec<u8> },
    /// The bare `#` return-code message.
    ReturnCode { topic: String, status: u8 },
}

struct Active {
    op: Op,
    target: Target,
    region_id: u8,
    return_topic: String,
    data: Vec<u8>,
    valid: usize,
    sent: usize,
    total_len: usize,
    status: u8,
}

/// Per-device memory-op state. At most one [`Active`] operation at a time.
pub struct MemoryOpCoordinator {
    active: Option<Active>,
    chunk_size: usize,
    buffer_size: usize,
}

impl MemoryOpCoordinator {
    pub fn new(chunk_size: usize, buffer_size: usize) -> Self {
        MemoryOpCoordinator {
            active: None,
            chunk_size,
            buffer_size,
        }
    }

    /// True while an operation is in flight (a new request will abort it).
    pub fn busy(&self) -> bool {
        self.active.is_some()
    }

    fn abort_active(&mut self) -> Option<Completion> {
        self.active.take().map(|active| {
            log::warn!(
                "memory-op on {:?} aborted by new request",
                active.return_topic
            );
            Completion::ReturnCode {
                topic: active.return_topic,
                status: 1,
            }
        })
    }

    /// Start `Erase`. Returns the aborted-previous completion (if any) and
    /// the frame to send.
    pub fn start_erase(&mut self, req: &MemRequest) -> (Option<Completion>, OutFrame) {
        let aborted = self.abort_active();
        self.active = Some(Active {
            op: Op::Erase,
            target: req.target,
            region_id: req.region_id,
            return_topic: req.return_topic.clone(),
            data: Vec::new(),
            valid: 0,
            sent: 0,
            total_len: 0,
            status: 0,
        });
        (aborted, OutFrame::Erase { region_id: req.region_id })
    }

    pub fn start_write(
        &mut self,
        req: &MemRequest,
        data: Vec<u8>,
    ) -> Result<(Option<Completion>, OutFrame)> {
        if data.len() > MAX_OP_LEN {
            return Err(DriverError::TooBig {
                requested: data.len(),
                limit: MAX_OP_LEN,
            });
        }
        let aborted = self.abort_active();
        let total_len = data.len() as u32;
        self.active = Some(Active {
            op: Op::WriteStart,
            target: req.target,
            region_id: req.region_id,
            return_topic: req.return_topic.clone(),
            data,
            valid: 0,
            sent: 0,
            total_len: total_len as usize,
            status: 0,
        });
        Ok((
            aborted,
            OutFrame::WriteStart {
                region_id: req.region_id,
                total_len,
            },
        ))
    }

    pub fn start_read(
        &mut self,
        req: &MemRequest,
        len: Option<usize>,
    ) -> Result<(Option<Completion>, OutFrame)> {
        let len = len.unwrap_or(DEFAULT_READ_LEN);
        if len > MAX_OP_LEN {
            return Err(DriverError::TooBig {
                requested: len,
                limit: MAX_OP_LEN,
            });
        }
        let aborted = self.abort_active();
        self.active = Some(Active {
            op: Op::ReadReq,
            target: req.target,
            region_id: req.region_id,
            return_topic: req.return_topic.clone(),
            data: Vec::new(),
            valid: 0,
            sent: 0,
            total_len: len,
            status: 0,
        });
        Ok((
            aborted,
            OutFrame::ReadReq {
                region_id: req.region_id,
                len: len as u32,
            },
        ))
    }

    /// An ack arrived on port 3 for `write-start`: the device accepted the
    /// announced length; advance to streaming data chunks and fill the
    /// send window with as many chunks as currently fit.
    pub fn on_write_start_ack(&mut self) -> Vec<OutFrame> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if active.op != Op::WriteStart {
            return Vec::new();
        }
        active.op = Op::WriteData;
        self.fill_write_window()
    }

    /// An ack arrived reporting `accepted_offset` bytes now valid on the
    /// device. Advances the send window and returns the chunk(s) now free
    /// to send, or the `write-finalize` frame once the transfer completes.
    pub fn on_write_data_ack(&mut self, accepted_offset: u32) -> Result<Vec<OutFrame>> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| DriverError::Synchronization {
                expected: 0,
                got: accepted_offset,
            })?;
        if accepted_offset as usize != active.valid {
            let expected = active.valid as u32;
            self.active = None;
            return Err(DriverError::Synchronization {
                expected,
                got: accepted_offset,
            });
        }
        active.valid = accepted_offset as usize;
        if active.valid >= active.total_len {
            active.op = Op::WriteFinalize;
            return Ok(vec![OutFrame::WriteFinalize]);
        }
        Ok(self.fill_write_window())
    }

    /// Push chunks onto the wire until the send-side window is full:
    /// `sent - valid < buffer_size - chunk_size` (spec §4.6).
    fn fill_write_window(&mut self) -> Vec<OutFrame> {
        let mut frames = Vec::new();
        loop {
            let active = match self.active.as_mut() {
                Some(a) => a,
                None => break,
            };
            if active.sent >= active.total_len
                || active.sent - active.valid >= self.buffer_size.saturating_sub(self.chunk_size)
            {
                break;
            }
            let end = (active.sent + self.chunk_size).min(active.total_len);
            let chunk = active.data[active.sent..end].to_vec();
            let offset = active.sent as u32;
            active.sent = end;
            frames.push(OutFrame::WriteData { offset, chunk });
        }
        frames
    }

    /// The device acked `write-finalize`: the write is complete.
    pub fn on_write_finalize_ack(&mut self) -> Option<Completion> {
        let active = self.active.take()?;
        if active.op != Op::WriteFinalize {
            self.active = Some(active);
            return None;
        }
        Some(Completion::ReturnCode {
            topic: active.return_topic,
            status: 0,
        })
    }

    /// The device accepted `read-req` and is about to stream `read-data`.
    pub fn on_read_req_ack(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if active.op == Op::ReadReq {
                active.op = Op::ReadData;
            }
        }
    }

    /// `read-data` arrived carrying `offset`/`payload`. Accept when
    /// `offset == valid` and `payload.len() <= chunk max`; otherwise record
    /// the first non-zero status and keep reading to drain (spec §4.6).
    pub fn on_read_data(&mut self, offset: u32, payload: &[u8]) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.op != Op::ReadData {
            return;
        }
        if offset as usize == active.valid && payload.len() <= self.chunk_size {
            active.data.extend_from_slice(payload);
            active.valid += payload.len();
        } else if active.status == 0 {
            log::warn!(
                "memory-op read out-of-sequence: expected offset={} got={}",
                active.valid,
                offset
            );
            active.status = 1;
        }
    }

    /// The terminating ack for a read arrived: emit the `!rdata` binary
    /// result (truncated to what was actually accepted) then the `#`
    /// return-code message.
    pub fn on_read_terminating_ack(&mut self) -> Option<[Completion; 2]> {
        let active = self.active.take()?;
        if active.op != Op::ReadData {
            self.active = Some(active);
            return None;
        }
        let rdata_topic = active.return_topic.trim_end_matches('#').to_string() + "!rdata";
        Some([
            Completion::ReadData {
                topic: rdata_topic,
                data: active.data,
            },
            Completion::ReturnCode {
                topic: active.return_topic,
                status: active.status,
            },
        ])
    }

    /// The device acked `erase`.
    pub fn on_erase_ack(&mut self) -> Option<Completion> {
        let active = self.active.take()?;
        if active.op != Op::Erase {
            self.active = Some(active);
            return None;
        }
        Some(Completion::ReturnCode {
            topic: active.return_topic,
            status: 0,
        })
    }

    /// Bytes `sent - valid` currently outstanding, for window invariant
    /// assertions (spec §8 "Memory-op ordering").
    pub fn outstanding(&self) -> usize {
        self.active
            .as_ref()
            .map(|a| a.sent - a.valid)
            .unwrap_or(0)
    }

    pub fn valid_offset(&self) -> usize {
        self.active.as_ref().map(|a| a.valid).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_controller_write_topic() {
        let req = parse_request("h/mem/c/app/!write").unwrap();
        assert_eq!(req.target, Target::Controller);
        assert_eq!(req.region, "app");
        assert_eq!(req.region_id, 0);
        assert_eq!(req.verb, Verb::Write);
        assert_eq!(req.return_topic, "h/mem/c/app/!write#");
    }

    #[test]
    fn parses_sensor_read_topic() {
        let req = parse_request("h/mem/s/cal_a/!read").unwrap();
        assert_eq!(req.target, Target::Sensor);
        assert_eq!(req.region_id, 3);
    }

    #[test]
    fn unknown_region_is_parameter_invalid() {
        assert!(matches!(
            parse_request("h/mem/c/nonsense/!erase"),
            Err(DriverError::ParameterInvalid(_))
        ));
    }

    #[test]
    fn write_sequence_issues_n_plus_2_frames_and_window_stays_bounded() {
        let req = parse_request("h/mem/c/app/!write").unwrap();
        let total = 8192usize;
        let chunk_size = 486usize;
        let buffer_size = 8192usize;
        let mut coord = MemoryOpCoordinator::new(chunk_size, buffer_size);

        let data = vec![0xABu8; total];
        let (_, start_frame) = coord.start_write(&req, data).unwrap();
        assert_eq!(
            start_frame,
            OutFrame::WriteStart {
                region_id: 0,
                total_len: total as u32
            }
        );

        let mut frame_count = 1; // write-start
        let mut pending: std::collections::VecDeque<OutFrame> =
            coord.on_write_start_ack().into_iter().collect();
        let mut finalized = false;
        while let Some(frame) = pending.pop_front() {
            frame_count += 1;
            assert!(coord.outstanding() <= buffer_size - chunk_size);
            match frame {
                OutFrame::WriteFinalize => {
                    finalized = true;
                }
                OutFrame::WriteData { offset, chunk } => {
                    let accepted = offset + chunk.len() as u32;
                    pending.extend(coord.on_write_data_ack(accepted).unwrap());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(finalized);

        let expected_data_frames = total.div_ceil(chunk_size);
        // +1 write-start, +1 write-finalize.
        assert_eq!(frame_count, expected_data_frames + 2);

        let completion = coord.on_write_finalize_ack().unwrap();
        assert_eq!(
            completion,
            Completion::ReturnCode {
                topic: "h/mem/c/app/!write#".to_string(),
                status: 0
            }
        );
        assert!(!coord.busy());
    }

    #[test]
    fn out_of_sequence_write_ack_aborts_with_synchronization_error() {
        let req = parse_request("h/mem/c/app/!write").unwrap();
        let mut coord = MemoryOpCoordinator::new(64, 256);
        coord.start_write(&req, vec![0u8; 200]).unwrap();
        coord.on_write_start_ack();
        assert!(coord.on_write_data_ack(999).is_err());
        assert!(!coord.busy());
    }

    #[test]
    fn new_request_aborts_in_flight_operation() {
        let req = parse_request("h/mem/c/app/!write").unwrap();
        let mut coord = MemoryOpCoordinator::new(64, 256);
        coord.start_write(&req, vec![0u8; 1000]).unwrap();
        assert!(coord.busy());

        let erase_req = parse_request("h/mem/c/upd1/!erase").unwrap();
        let (aborted, _) = coord.start_erase(&erase_req);
        assert_eq!(
            aborted,
            Some(Completion::ReturnCode {
                topic: "h/mem/c/app/!write#".to_string(),
                status: 1
            })
        );
    }

    #[test]
    fn read_drains_after_out_of_sequence_status_and_reports_first_error() {
        let req = parse_request("h/mem/c/app/!read").unwrap();
        let mut coord = MemoryOpCoordinator::new(64, 256);
        coord.start_read(&req, Some(128)).unwrap();
        coord.on_read_req_ack();

        coord.on_read_data(0, &[1u8; 64]);
        coord.on_read_data(0, &[2u8; 64]); // out of sequence, recorded
        coord.on_read_data(64, &[3u8; 64]);

        let [rdata, code] = coord.on_read_terminating_ack().unwrap();
        match rdata {
            Completion::ReadData { topic, data } => {
                assert_eq!(topic, "h/mem/c/app/!read!rdata");
                assert_eq!(data.len(), 128); // second chunk rejected; first and third accepted
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(
            code,
            Completion::ReturnCode {
                topic: "h/mem/c/app/!read#".to_string(),
                status: 1
            }
        );
    }
}

// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Real-time H.264 stream reception.
//!
//! The sender packetizes an H.264 elementary stream into the RTP-style
//! datagrams described in [`crate::rtp`], using the [RFC
//! 6184](https://tools.ietf.org/html/rfc6184) payload shapes: single NAL
//! unit, FU-A fragmentation for NAL units larger than a datagram, and STAP-A
//! aggregation for runs of small ones. A [`StreamReader`] binds a UDP socket
//! (unicast or multicast), reassembles NAL units into a consumer-owned
//! [`ReassemblyBuffer`], and upcalls [`NaluEvent::Complete`] per NAL unit
//! with access-unit boundary flags derived from the marker bit.
//!
//! The receive worker ([`StreamReader::run_recv_worker`]) is a blocking loop
//! meant for a caller-spawned thread; a second, currently idle, send worker
//! entry point keeps the two-worker lifecycle uniform with
//! [`crate::frame::FrameReader`]. Reception statistics over a recent window
//! are available from [`StreamReader::monitoring`].

use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::buffer::ReassemblyBuffer;
use crate::error::ErrorInt;
use crate::hex::LimitedHex;
use crate::monitor::{MonitoringRing, MonitoringStats};
use crate::rtp::{self, media_timestamp_to_micros, PacketRef};
use crate::{Error, WallTime};

/// Bound on each receive-loop iteration, so a stop request is observed
/// promptly even when no data arrives.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Receive-buffer target. Half is requested because the kernel typically
/// doubles the requested value.
const RECV_BUFFER_SIZE: usize = 600 * 1024;

/// Assumed when [`StreamConfig::max_packet_size`] is zero: an Ethernet MTU.
const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

const IP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// The Annex B sentinel optionally prepended to each NAL unit.
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// RFC 6184 payload types handled beyond plain NAL units.
const NALU_TYPE_STAP_A: u8 = 24;
const NALU_TYPE_FU_A: u8 = 28;

/// Upcall from the receive worker to the consumer. The returned
/// `Option<ReassemblyBuffer>` hands the next buffer to the reader; its
/// meaning depends on the event, see each variant.
pub enum NaluEvent {
    /// A NAL unit is complete in `buf[..len]`, prefixed with the Annex B
    /// start code when [`StreamConfig::insert_start_codes`] is set. Return
    /// the buffer to fill next (commonly the same one).
    Complete {
        buf: ReassemblyBuffer,
        len: usize,

        /// Media timestamp, microseconds.
        timestamp_us: u64,

        /// True iff this packet started its access unit.
        first_of_au: bool,

        /// True iff the marker bit was set: the last NAL unit of the access
        /// unit.
        last_of_au: bool,

        /// Sequence-number gaps observed since the access unit started.
        missing_packets: i32,
    },

    /// The current buffer cannot hold the NAL unit being assembled. Return
    /// a buffer of at least `needed` bytes: the reader copies the
    /// `len_so_far` accumulated bytes into it and keeps going. A smaller
    /// grant is adopted anyway but this packet's write is skipped; `None`
    /// keeps the current buffer and stalls writes until a later grant.
    BufferTooSmall { len_so_far: usize, needed: usize },

    /// The reader is done with `buf` after a [`NaluEvent::BufferTooSmall`]
    /// exchange; its first `len` bytes were the accumulated prefix. The
    /// return value is ignored.
    CopyComplete { buf: ReassemblyBuffer, len: usize },

    /// The reader is shutting down and returns its buffer. The return value
    /// is ignored.
    Cancel { buf: ReassemblyBuffer, len: usize },
}

pub type NaluCallback = Box<dyn FnMut(NaluEvent) -> Option<ReassemblyBuffer> + Send>;

/// Where and how to receive the stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Address to receive on. A multicast address (224.0.0.0/4) joins that
    /// group; anything else selects plain unicast reception.
    pub recv_addr: Option<Ipv4Addr>,

    /// Local interface address: the multicast interface, or the unicast
    /// bind address. `None` falls back to `INADDR_ANY`.
    pub iface_addr: Option<Ipv4Addr>,

    /// UDP port to receive on; must be nonzero.
    pub recv_port: u16,

    /// Socket receive-timeout contract; must be nonzero.
    pub recv_timeout: Duration,

    /// Largest datagram the sender may emit, including IP and UDP headers.
    /// Zero means an Ethernet MTU.
    pub max_packet_size: usize,

    /// Prepend the 4-byte Annex B start code to every NAL unit, as raw
    /// elementary-stream consumers expect.
    pub insert_start_codes: bool,
}

struct StreamState {
    should_stop: bool,
    recv_worker_started: bool,
    send_worker_started: bool,
}

/// State owned by whichever thread enters
/// [`StreamReader::run_recv_worker`].
struct AssemblyState {
    buf: ReassemblyBuffer,
    callback: NaluCallback,
}

struct Shared {
    config: StreamConfig,

    /// Largest payload a datagram can carry after IP, UDP, and stream
    /// headers; sizes the receive buffer.
    max_payload_size: usize,

    custom: Box<dyn Any + Send + Sync>,

    /// Anchor for the monotonic reception clock.
    epoch: Instant,

    stream: Mutex<StreamState>,
    monitoring: Mutex<MonitoringRing>,
    assembly: Mutex<Option<AssemblyState>>,
}

/// Receiver for the real-time packetized stream. Cheaply cloneable; clone a
/// handle per worker thread.
#[derive(Clone)]
pub struct StreamReader {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl StreamReader {
    /// Creates a reader that assembles NAL units into `buf`, upcalling
    /// `callback` as described on [`NaluEvent`]. `custom` is an opaque
    /// consumer token retrievable via [`StreamReader::custom`].
    pub fn new(
        config: StreamConfig,
        callback: NaluCallback,
        buf: ReassemblyBuffer,
        custom: Box<dyn Any + Send + Sync>,
    ) -> Result<Self, Error> {
        if config.recv_port == 0 {
            bail!(ErrorInt::InvalidArgument("recv_port must be nonzero".to_owned()));
        }
        if config.recv_timeout.is_zero() {
            bail!(ErrorInt::InvalidArgument(
                "recv_timeout must be nonzero".to_owned()
            ));
        }
        if buf.capacity() == 0 {
            bail!(ErrorInt::InvalidArgument(
                "NAL unit buffer must have nonzero capacity".to_owned()
            ));
        }
        const OVERHEAD: usize = IP_HEADER_LEN + UDP_HEADER_LEN + rtp::HEADER_LEN;
        let max_payload_size = if config.max_packet_size > 0 {
            match config.max_packet_size.checked_sub(OVERHEAD) {
                Some(s) if s > 0 => s,
                _ => bail!(ErrorInt::InvalidArgument(format!(
                    "max_packet_size {} can't hold the IP, UDP, and stream headers",
                    config.max_packet_size
                ))),
            }
        } else {
            DEFAULT_MAX_PACKET_SIZE - OVERHEAD
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                max_payload_size,
                custom,
                epoch: Instant::now(),
                stream: Mutex::new(StreamState {
                    should_stop: false,
                    recv_worker_started: false,
                    send_worker_started: false,
                }),
                monitoring: Mutex::new(MonitoringRing::new()),
                assembly: Mutex::new(Some(AssemblyState { buf, callback })),
            }),
        })
    }

    /// The consumer token supplied at construction.
    pub fn custom(&self) -> &(dyn Any + Send + Sync) {
        self.shared.custom.as_ref()
    }

    fn should_stop(&self) -> bool {
        self.shared
            .stream
            .lock()
            .expect("stream state poisoned")
            .should_stop
    }

    /// Requests that the workers exit. Idempotent; the receive worker
    /// notices within its 500 ms loop bound.
    pub fn stop(&self) {
        debug!("stopping stream reader...");
        self.shared
            .stream
            .lock()
            .expect("stream state poisoned")
            .should_stop = true;
    }

    /// Releases this handle. Refused (the handle is returned for a later
    /// retry) while either worker is still running; call
    /// [`StreamReader::stop`] and join the worker threads first.
    pub fn delete(self) -> Result<(), Self> {
        let can_delete = {
            let stream = self.shared.stream.lock().expect("stream state poisoned");
            !stream.recv_worker_started && !stream.send_worker_started
        };
        if can_delete {
            Ok(())
        } else {
            error!("stream reader still has running workers; stop it first");
            Err(self)
        }
    }

    /// Reception statistics over the last `interval_us` microseconds (or as
    /// much history as the ring holds). Errors on a zero interval or before
    /// the first packet arrives.
    pub fn monitoring(&self, interval_us: u64) -> Result<MonitoringStats, Error> {
        if interval_us == 0 {
            bail!(ErrorInt::InvalidArgument(
                "monitoring interval must be nonzero".to_owned()
            ));
        }
        let ring = self.shared.monitoring.lock().expect("monitoring poisoned");
        match ring.query(interval_us) {
            Some(stats) => Ok(stats),
            None => bail!(ErrorInt::InvalidArgument(
                "no packets received yet".to_owned()
            )),
        }
    }

    /// Creates and configures the receive socket.
    fn bind(&self) -> Result<UdpSocket, Error> {
        use socket2::{Domain, Protocol, Socket, Type};
        let config = &self.shared.config;
        let multicast_group = config.recv_addr.filter(|a| a.is_multicast());
        let bind_ip = match (multicast_group, config.iface_addr) {
            (Some(_), _) => Ipv4Addr::UNSPECIFIED,
            (None, Some(iface)) => iface,
            (None, None) => Ipv4Addr::UNSPECIFIED,
        };
        let addr = SocketAddr::from((bind_ip, config.recv_port));
        let bind_err = |source: std::io::Error| {
            wrap!(ErrorInt::BindError {
                addr,
                when: WallTime::now(),
                source,
            })
        };
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        // The kernel doubles the requested value.
        socket
            .set_recv_buffer_size(RECV_BUFFER_SIZE / 2)
            .map_err(bind_err)?;
        socket
            .set_read_timeout(Some(RECV_POLL_TIMEOUT.min(config.recv_timeout)))
            .map_err(bind_err)?;
        if let Some(group) = multicast_group {
            let iface = config.iface_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &iface).map_err(bind_err)?;
        }
        socket.bind(&addr.into()).map_err(bind_err)?;
        Ok(socket.into())
    }

    /// Entry point for the receive worker thread. Binds the socket, then
    /// blocks until [`StreamReader::stop`]; on the way out, upcalls
    /// [`NaluEvent::Cancel`]. A bind failure aborts the worker before its
    /// started flag is ever set.
    pub fn run_recv_worker(&self) {
        let shared = &*self.shared;
        let socket = match self.bind() {
            Ok(s) => s,
            Err(e) => {
                error!("failed to bind; aborting stream receive worker: {e}");
                return;
            }
        };
        let state = match shared
            .assembly
            .lock()
            .expect("assembly state poisoned")
            .take()
        {
            Some(s) => s,
            None => {
                error!("stream receive worker is already running; refusing to start again");
                return;
            }
        };
        let mut recv = vec![0u8; shared.max_payload_size + rtp::HEADER_LEN];

        debug!("stream receive worker running");
        shared
            .stream
            .lock()
            .expect("stream state poisoned")
            .recv_worker_started = true;

        let mut assembler =
            NaluAssembler::new(state.buf, state.callback, shared.config.insert_start_codes);
        while !self.should_stop() {
            let n = match socket.recv(&mut recv) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!("error receiving datagram: {e}");
                    continue;
                }
            };
            // Datagrams shorter than the header are discarded silently.
            let pkt = match PacketRef::new(&recv[..n]) {
                Some(p) => p,
                None => continue,
            };
            let recv_timestamp = shared.epoch.elapsed().as_micros() as u64;
            shared
                .monitoring
                .lock()
                .expect("monitoring poisoned")
                .record(
                    recv_timestamp,
                    pkt.timestamp(),
                    pkt.sequence_number(),
                    pkt.mark(),
                    n as u32,
                );
            assembler.push(pkt);
        }
        drop(socket);

        let callback = assembler.cancel();
        *shared.assembly.lock().expect("assembly state poisoned") = Some(AssemblyState {
            buf: ReassemblyBuffer::empty(),
            callback,
        });

        debug!("stream receive worker ended");
        shared
            .stream
            .lock()
            .expect("stream state poisoned")
            .recv_worker_started = false;
    }

    /// Entry point for the send worker thread. Currently has no duties and
    /// returns immediately; reserved for receiver-report feedback. It exists
    /// so the two-worker lifecycle matches the fragmented-stream reader.
    pub fn run_send_worker(&self) {
        debug!("stream send worker running");
        self.shared
            .stream
            .lock()
            .expect("stream state poisoned")
            .send_worker_started = true;

        debug!("stream send worker ended");
        self.shared
            .stream
            .lock()
            .expect("stream state poisoned")
            .send_worker_started = false;
    }
}

/// The NAL-unit assembly state machine, fed one datagram at a time.
/// Unstable/internal. Exposed for benchmarks.
#[doc(hidden)]
pub struct NaluAssembler {
    buf: ReassemblyBuffer,

    /// Bytes of the in-progress NAL unit written so far.
    nalu_len: usize,

    callback: NaluCallback,
    insert_start_codes: bool,

    /// True while inside a FU-A whose end fragment hasn't arrived.
    fu_pending: bool,

    /// Bytes delivered for the current access unit.
    au_len: usize,

    /// Sequence gaps since the access unit started.
    gaps: i32,

    /// Sequence number that started the current access unit.
    start_seq: u16,

    previous_seq: Option<u16>,
    previous_timestamp_us: Option<u64>,
}

impl NaluAssembler {
    #[doc(hidden)]
    pub fn new(buf: ReassemblyBuffer, callback: NaluCallback, insert_start_codes: bool) -> Self {
        Self {
            buf,
            nalu_len: 0,
            callback,
            insert_start_codes,
            fu_pending: false,
            au_len: 0,
            gaps: 0,
            start_seq: 0,
            previous_seq: None,
            previous_timestamp_us: None,
        }
    }

    fn start_code_len(&self) -> usize {
        if self.insert_start_codes {
            START_CODE.len()
        } else {
            0
        }
    }

    /// Feeds one datagram through the state machine.
    #[doc(hidden)]
    pub fn push(&mut self, pkt: PacketRef<'_>) {
        let seq = pkt.sequence_number();
        let timestamp_us = media_timestamp_to_micros(pkt.timestamp());
        let marker = pkt.mark();

        if self.au_len == 0 {
            self.start_seq = seq;
        }

        let delta = match self.previous_seq {
            Some(previous) => i32::from(seq.wrapping_sub(previous) as i16),
            None => 1,
        };
        if delta <= 0 {
            debug!(
                "out of order sequence number (seq={seq}, previous={:?}, delta={delta})",
                self.previous_seq
            );
            return;
        }
        self.gaps += delta - 1;

        if let Some(previous_ts) = self.previous_timestamp_us {
            if previous_ts != timestamp_us {
                if self.gaps != 0 {
                    // The reserved incomplete-AU upcall would fire here.
                    debug!(
                        "incomplete access unit before seq {seq}, size {} bytes \
                         ({} missing packets)",
                        self.au_len, self.gaps
                    );
                }
                self.gaps = 0;
                self.au_len = 0;
            }
        }

        let payload = pkt.payload();
        if payload.is_empty() {
            debug!("empty payload at seq {seq}");
        } else {
            match payload[0] & 0x1f {
                NALU_TYPE_FU_A => self.push_fu_a(payload, timestamp_us, seq, marker),
                NALU_TYPE_STAP_A => self.push_stap_a(payload, timestamp_us, seq, marker),
                _ => self.push_single(payload, timestamp_us, seq, marker),
            }
        }

        if marker {
            debug!(
                "complete access unit at seq {seq}, size {} bytes ({} missing packets)",
                self.au_len, self.gaps
            );
            self.gaps = 0;
            self.au_len = 0;
        }

        self.previous_seq = Some(seq);
        self.previous_timestamp_us = Some(timestamp_us);
    }

    /// Fragmentation units, RFC 6184 section 5.8.
    fn push_fu_a(&mut self, payload: &[u8], timestamp_us: u64, seq: u16, marker: bool) {
        if payload.len() < 2 {
            debug!(
                "invalid payload size ({}) for FU-A at seq {seq}",
                payload.len()
            );
            return;
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;

        if self.fu_pending && start {
            self.fu_pending = false;
            debug!("abandoning incomplete FU-A before new FU-A start at seq {seq}");
        }
        if start {
            self.fu_pending = true;
            self.nalu_len = 0;
        }
        if self.fu_pending {
            let frag = &payload[2..];
            let needed = frag.len() + if start { self.start_code_len() + 1 } else { 0 };
            if self.ensure_capacity(needed) {
                if start {
                    if self.insert_start_codes {
                        self.buf[self.nalu_len..self.nalu_len + START_CODE.len()]
                            .copy_from_slice(&START_CODE);
                        self.nalu_len += START_CODE.len();
                        self.au_len += START_CODE.len();
                    }
                    // Restore the NAL header byte the fragmenter consumed.
                    self.buf[self.nalu_len] = (fu_indicator & 0xe0) | (fu_header & 0x1f);
                    self.nalu_len += 1;
                    self.au_len += 1;
                }
                self.buf[self.nalu_len..self.nalu_len + frag.len()].copy_from_slice(frag);
                self.nalu_len += frag.len();
                self.au_len += frag.len();
                if end {
                    self.complete(timestamp_us, self.start_seq == seq, marker);
                }
            } else {
                debug!("no buffer for {needed} more bytes of FU-A at seq {seq}");
            }
        }
        if end {
            self.fu_pending = false;
        }
    }

    /// Single-time aggregation packets, RFC 6184 section 5.7.1: 2-byte
    /// size-prefixed NAL units after the aggregation header byte.
    fn push_stap_a(&mut self, payload: &[u8], timestamp_us: u64, seq: u16, marker: bool) {
        if self.fu_pending {
            self.fu_pending = false;
            debug!("abandoning incomplete FU-A before STAP-A at seq {seq}");
        }
        let mut data = &payload[1..];
        let mut first_in_aggregate = true;
        while !data.is_empty() {
            if data.len() < 2 {
                debug!(
                    "STAP-A truncated while expecting a 2-byte length at seq {seq}: {:?}",
                    LimitedHex::new(payload, 64)
                );
                break;
            }
            let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
            data = &data[2..];
            if len == 0 || len > data.len() {
                debug!(
                    "bad NAL unit length {len} ({} bytes remaining) in STAP-A at seq {seq}",
                    data.len()
                );
                break;
            }
            let (nalu, rest) = data.split_at(len);
            data = rest;

            self.nalu_len = 0;
            if self.ensure_capacity(len + self.start_code_len()) {
                if self.insert_start_codes {
                    self.buf[..START_CODE.len()].copy_from_slice(&START_CODE);
                    self.nalu_len += START_CODE.len();
                    self.au_len += START_CODE.len();
                }
                self.buf[self.nalu_len..self.nalu_len + len].copy_from_slice(nalu);
                self.nalu_len += len;
                self.au_len += len;
                self.complete(
                    timestamp_us,
                    self.start_seq == seq && first_in_aggregate,
                    marker && data.is_empty(),
                );
            } else {
                debug!("no buffer for a {len} byte aggregated NAL unit at seq {seq}");
            }
            first_in_aggregate = false;
        }
    }

    fn push_single(&mut self, payload: &[u8], timestamp_us: u64, seq: u16, marker: bool) {
        if self.fu_pending {
            self.fu_pending = false;
            debug!("abandoning incomplete FU-A before single NAL unit at seq {seq}");
        }
        self.nalu_len = 0;
        let needed = payload.len() + self.start_code_len();
        if self.ensure_capacity(needed) {
            if self.insert_start_codes {
                self.buf[..START_CODE.len()].copy_from_slice(&START_CODE);
                self.nalu_len += START_CODE.len();
                self.au_len += START_CODE.len();
            }
            self.buf[self.nalu_len..self.nalu_len + payload.len()].copy_from_slice(payload);
            self.nalu_len += payload.len();
            self.au_len += payload.len();
            self.complete(timestamp_us, self.start_seq == seq, marker);
        } else {
            debug!("no buffer for a {needed} byte NAL unit at seq {seq}");
        }
    }

    /// Makes room to append `needed` more bytes, upcalling for a larger
    /// buffer when the current one is exhausted. Returns false if the write
    /// must be skipped.
    fn ensure_capacity(&mut self, needed: usize) -> bool {
        if self.nalu_len + needed <= self.buf.capacity() {
            return true;
        }
        let proposal = self.nalu_len + needed;
        match (self.callback)(NaluEvent::BufferTooSmall {
            len_so_far: self.nalu_len,
            needed: proposal,
        }) {
            Some(mut next) => {
                let fits = next.capacity() >= proposal;
                if fits {
                    next[..self.nalu_len].copy_from_slice(&self.buf[..self.nalu_len]);
                }
                let old = std::mem::replace(&mut self.buf, next);
                (self.callback)(NaluEvent::CopyComplete {
                    buf: old,
                    len: self.nalu_len,
                });
                if !fits {
                    // The grant is adopted but can't hold the prefix; keep
                    // later writes in bounds.
                    self.nalu_len = self.nalu_len.min(self.buf.capacity());
                }
                fits
            }
            None => false,
        }
    }

    fn complete(&mut self, timestamp_us: u64, first_of_au: bool, last_of_au: bool) {
        let len = self.nalu_len;
        let buf = std::mem::replace(&mut self.buf, ReassemblyBuffer::empty());
        let next = (self.callback)(NaluEvent::Complete {
            buf,
            len,
            timestamp_us,
            first_of_au,
            last_of_au,
            missing_packets: self.gaps,
        });
        self.buf = next.unwrap_or_else(ReassemblyBuffer::empty);
    }

    /// Hands the buffer back to the consumer and dissolves the assembler,
    /// returning the callback for reuse.
    fn cancel(self) -> NaluCallback {
        let Self {
            buf, mut callback, ..
        } = self;
        callback(NaluEvent::Cancel { buf, len: 0 });
        callback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::PacketBuilder;
    use std::sync::{Arc, Mutex};

    fn datagram(seq: u16, timestamp: u32, mark: bool, payload: &[u8]) -> Vec<u8> {
        PacketBuilder {
            sequence_number: seq,
            timestamp,
            ssrc: 0x4242_4242,
            mark,
        }
        .build(payload)
    }

    fn push(assembler: &mut NaluAssembler, datagram: &[u8]) {
        assembler.push(PacketRef::new(datagram).unwrap());
    }

    /// FU-A fragment of the NAL unit whose header byte is `nal_header`.
    fn fu_a(
        seq: u16,
        timestamp: u32,
        mark: bool,
        nal_header: u8,
        start: bool,
        end: bool,
        frag: &[u8],
    ) -> Vec<u8> {
        let fu_indicator = (nal_header & 0xe0) | NALU_TYPE_FU_A;
        let mut fu_header = nal_header & 0x1f;
        if start {
            fu_header |= 0x80;
        }
        if end {
            fu_header |= 0x40;
        }
        let mut payload = vec![fu_indicator, fu_header];
        payload.extend_from_slice(frag);
        datagram(seq, timestamp, mark, &payload)
    }

    struct CompletedNalu {
        data: Vec<u8>,
        timestamp_us: u64,
        first_of_au: bool,
        last_of_au: bool,
        missing_packets: i32,
    }

    #[derive(Default)]
    struct Events {
        completes: Vec<CompletedNalu>,
        too_smalls: Vec<usize>,
        copy_completes: usize,
        cancels: usize,
    }

    /// Callback that records everything; `grant` maps a `BufferTooSmall`
    /// proposal to a replacement capacity, with `None` refusing the grant.
    fn collector(
        events: Arc<Mutex<Events>>,
        mut grant: impl FnMut(usize) -> Option<usize> + Send + 'static,
    ) -> NaluCallback {
        Box::new(move |event| {
            let mut events = events.lock().unwrap();
            match event {
                NaluEvent::Complete {
                    buf,
                    len,
                    timestamp_us,
                    first_of_au,
                    last_of_au,
                    missing_packets,
                } => {
                    events.completes.push(CompletedNalu {
                        data: buf[..len].to_vec(),
                        timestamp_us,
                        first_of_au,
                        last_of_au,
                        missing_packets,
                    });
                    Some(buf)
                }
                NaluEvent::BufferTooSmall { needed, .. } => {
                    events.too_smalls.push(needed);
                    grant(needed).map(ReassemblyBuffer::with_capacity)
                }
                NaluEvent::CopyComplete { .. } => {
                    events.copy_completes += 1;
                    None
                }
                NaluEvent::Cancel { .. } => {
                    events.cancels += 1;
                    None
                }
            }
        })
    }

    fn assembler_with(
        capacity: usize,
        insert_start_codes: bool,
        grant: impl FnMut(usize) -> Option<usize> + Send + 'static,
    ) -> (NaluAssembler, Arc<Mutex<Events>>) {
        let events = Arc::new(Mutex::new(Events::default()));
        let assembler = NaluAssembler::new(
            ReassemblyBuffer::with_capacity(capacity),
            collector(events.clone(), grant),
            insert_start_codes,
        );
        (assembler, events)
    }

    #[test]
    fn fu_a_reassembly() {
        // A large IDR slice (header byte 0x65) split into five fragments of
        // 998 data bytes each, so each datagram carries a 1000-byte payload.
        let frags: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i.wrapping_add(1); 998]).collect();
        for insert_start_codes in [false, true] {
            let (mut assembler, events) = assembler_with(8192, insert_start_codes, |_| None);
            for (i, frag) in frags.iter().enumerate() {
                let seq = 100 + i as u16;
                push(
                    &mut assembler,
                    &fu_a(seq, 90_000, i == 4, 0x65, i == 0, i == 4, frag),
                );
            }
            let events = events.lock().unwrap();
            assert_eq!(events.completes.len(), 1);
            let nalu = &events.completes[0];
            let mut expected = if insert_start_codes {
                vec![0, 0, 0, 1]
            } else {
                Vec::new()
            };
            expected.push(0x65);
            for frag in &frags {
                expected.extend_from_slice(frag);
            }
            assert_eq!(nalu.data, expected);
            assert_eq!(nalu.data.len(), 4991 + if insert_start_codes { 4 } else { 0 });
            assert_eq!(nalu.timestamp_us, 1_000_000);
            assert!(nalu.last_of_au);
            assert_eq!(nalu.missing_packets, 0);
        }
    }

    #[test]
    fn single_nalu_with_marker() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        push(&mut assembler, &datagram(7, 900, true, b"\x41rest of nalu"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        let nalu = &events.completes[0];
        assert_eq!(nalu.data, b"\x41rest of nalu");
        assert_eq!(nalu.timestamp_us, 10_000);
        assert!(nalu.first_of_au);
        assert!(nalu.last_of_au);
        assert_eq!(nalu.missing_packets, 0);
    }

    #[test]
    fn single_nalu_start_code() {
        let (mut assembler, events) = assembler_with(1024, true, |_| None);
        push(&mut assembler, &datagram(7, 0, true, b"\x41nalu"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes[0].data, b"\x00\x00\x00\x01\x41nalu");
    }

    #[test]
    fn out_of_order_packet_dropped() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        push(&mut assembler, &datagram(10, 0, true, b"\x41ten"));
        push(&mut assembler, &datagram(9, 0, true, b"\x41nine"));
        push(&mut assembler, &datagram(10, 0, true, b"\x41ten again"));
        push(&mut assembler, &datagram(11, 900, true, b"\x41eleven"));
        let events = events.lock().unwrap();
        let delivered: Vec<&[u8]> = events.completes.iter().map(|c| &c.data[..]).collect();
        assert_eq!(delivered, vec![&b"\x41ten"[..], &b"\x41eleven"[..]]);
        // previous_seq was not advanced by the dropped packets: no gap seen.
        assert_eq!(events.completes[1].missing_packets, 0);
    }

    #[test]
    fn gap_counting_and_marker_reset() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        push(&mut assembler, &datagram(20, 0, false, b"\x41first"));
        // Sequence 21 lost.
        push(&mut assembler, &datagram(22, 0, true, b"\x41second"));
        // New access unit after the marker: the counter must restart.
        push(&mut assembler, &datagram(23, 900, true, b"\x41third"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes[0].missing_packets, 0);
        assert_eq!(events.completes[1].missing_packets, 1);
        assert_eq!(events.completes[2].missing_packets, 0);
        assert!(events.completes[2].first_of_au);
        assert!(events.completes[2].last_of_au);
    }

    #[test]
    fn timestamp_change_resets_gap_counter() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        // An unterminated access unit (no marker), then a gap, then a new
        // timestamp: the old unit is logged as incomplete and the counter
        // resets.
        push(&mut assembler, &datagram(40, 0, false, b"\x41old au"));
        push(&mut assembler, &datagram(42, 900, false, b"\x41new au"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes[1].missing_packets, 0);
        assert!(!events.completes[1].first_of_au);
    }

    #[test]
    fn fu_a_abandoned_by_new_start() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        push(&mut assembler, &fu_a(1, 0, false, 0x65, true, false, b"lost"));
        push(&mut assembler, &fu_a(2, 0, false, 0x61, true, false, b"kept, "));
        push(&mut assembler, &fu_a(3, 0, true, 0x61, false, true, b"whole"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x61kept, whole");
    }

    #[test]
    fn fu_a_middle_without_start_ignored() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        push(&mut assembler, &fu_a(1, 0, false, 0x65, false, false, b"orphan"));
        push(&mut assembler, &fu_a(2, 0, true, 0x65, false, true, b"orphan end"));
        push(&mut assembler, &datagram(3, 900, true, b"\x41fine"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x41fine");
    }

    #[test]
    fn stap_a_aggregation() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        // Aggregation of an SPS and a PPS, marker set.
        let mut payload = vec![0x18];
        payload.extend_from_slice(&[0, 4]);
        payload.extend_from_slice(b"\x67sps");
        payload.extend_from_slice(&[0, 4]);
        payload.extend_from_slice(b"\x68pps");
        push(&mut assembler, &datagram(50, 0, true, &payload));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 2);
        assert_eq!(events.completes[0].data, b"\x67sps");
        assert!(events.completes[0].first_of_au);
        assert!(!events.completes[0].last_of_au);
        assert_eq!(events.completes[1].data, b"\x68pps");
        assert!(!events.completes[1].first_of_au);
        assert!(events.completes[1].last_of_au);
    }

    #[test]
    fn stap_a_truncated() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        // Second length claims more bytes than remain.
        let mut payload = vec![0x18];
        payload.extend_from_slice(&[0, 4]);
        payload.extend_from_slice(b"\x67sps");
        payload.extend_from_slice(&[0, 99]);
        payload.extend_from_slice(b"\x68p");
        push(&mut assembler, &datagram(60, 0, true, &payload));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x67sps");
    }

    #[test]
    fn stap_a_abandons_pending_fu_a() {
        let (mut assembler, events) = assembler_with(1024, false, |_| None);
        push(&mut assembler, &fu_a(1, 0, false, 0x65, true, false, b"lost"));
        let mut payload = vec![0x18];
        payload.extend_from_slice(&[0, 4]);
        payload.extend_from_slice(b"\x67sps");
        push(&mut assembler, &datagram(2, 0, true, &payload));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x67sps");
    }

    #[test]
    fn grows_buffer_on_demand() {
        let (mut assembler, events) = assembler_with(8, false, Some);
        push(&mut assembler, &datagram(1, 0, true, b"\x41a bigger nal unit"));
        let events = events.lock().unwrap();
        assert_eq!(events.too_smalls, vec![18]);
        assert_eq!(events.copy_completes, 1);
        assert_eq!(events.completes[0].data, b"\x41a bigger nal unit");
    }

    #[test]
    fn grows_mid_fu_a() {
        let (mut assembler, events) = assembler_with(8, false, Some);
        push(&mut assembler, &fu_a(1, 0, false, 0x65, true, false, b"0123456"));
        push(&mut assembler, &fu_a(2, 0, false, 0x65, false, false, b"789abcd"));
        push(&mut assembler, &fu_a(3, 0, true, 0x65, false, true, b"efghijk"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x650123456789abcdefghijk");
        assert!(events.copy_completes >= 2);
    }

    #[test]
    fn refused_grant_stalls_writes() {
        // The consumer refuses the first grant; the packet's write is
        // skipped without any panic and reassembly resumes once a later
        // grant succeeds.
        let mut requests = 0;
        let (mut assembler, events) = assembler_with(4, false, move |needed| {
            requests += 1;
            if requests == 1 {
                None
            } else {
                Some(needed)
            }
        });
        push(&mut assembler, &datagram(1, 0, true, b"\x41dropped nal unit"));
        push(&mut assembler, &datagram(2, 900, true, b"\x41delivered"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x41delivered");
        assert_eq!(events.too_smalls.len(), 2);
    }

    #[test]
    fn undersized_grant_is_adopted_without_panic() {
        let mut requests = 0;
        let (mut assembler, events) = assembler_with(4, false, move |needed| {
            requests += 1;
            if requests == 1 {
                Some(2) // smaller than requested
            } else {
                Some(needed)
            }
        });
        push(&mut assembler, &datagram(1, 0, true, b"\x41dropped nal unit"));
        push(&mut assembler, &datagram(2, 900, true, b"\x41delivered"));
        let events = events.lock().unwrap();
        assert_eq!(events.completes.len(), 1);
        assert_eq!(events.completes[0].data, b"\x41delivered");
        assert_eq!(events.copy_completes, 2);
    }

    #[test]
    fn rejects_bad_config() {
        let config = StreamConfig {
            recv_addr: None,
            iface_addr: None,
            recv_port: 5004,
            recv_timeout: Duration::from_secs(5),
            max_packet_size: 0,
            insert_start_codes: false,
        };
        for (config, what) in [
            (
                StreamConfig {
                    recv_port: 0,
                    ..config.clone()
                },
                "zero port",
            ),
            (
                StreamConfig {
                    recv_timeout: Duration::ZERO,
                    ..config.clone()
                },
                "zero timeout",
            ),
            (
                StreamConfig {
                    max_packet_size: IP_HEADER_LEN + UDP_HEADER_LEN,
                    ..config.clone()
                },
                "tiny max packet size",
            ),
        ] {
            let err = StreamReader::new(
                config,
                Box::new(|_| None),
                ReassemblyBuffer::with_capacity(16),
                Box::new(()),
            )
            .expect_err(what);
            assert!(err.is_invalid_argument(), "{what}");
        }
        let err = StreamReader::new(
            config,
            Box::new(|_| None),
            ReassemblyBuffer::empty(),
            Box::new(()),
        )
        .expect_err("zero-capacity buffer");
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn monitoring_validates_arguments() {
        let reader = StreamReader::new(
            StreamConfig {
                recv_addr: None,
                iface_addr: None,
                recv_port: 5004,
                recv_timeout: Duration::from_secs(5),
                max_packet_size: 0,
                insert_start_codes: false,
            },
            Box::new(|_| None),
            ReassemblyBuffer::with_capacity(16),
            Box::new(()),
        )
        .unwrap();
        assert!(reader.monitoring(0).expect_err("zero interval").is_invalid_argument());
        assert!(reader
            .monitoring(1_000_000)
            .expect_err("nothing received yet")
            .is_invalid_argument());
    }

    #[test]
    fn bind_failure_aborts_worker_cleanly() {
        // 192.0.2.0/24 (TEST-NET-1) is never a local interface, so the bind
        // fails; the worker must exit without setting its started flag or
        // upcalling cancel.
        let events = Arc::new(Mutex::new(Events::default()));
        let reader = StreamReader::new(
            StreamConfig {
                recv_addr: None,
                iface_addr: Some(Ipv4Addr::new(192, 0, 2, 1)),
                recv_port: 5004,
                recv_timeout: Duration::from_secs(5),
                max_packet_size: 0,
                insert_start_codes: false,
            },
            collector(events.clone(), |_| None),
            ReassemblyBuffer::with_capacity(16),
            Box::new(()),
        )
        .unwrap();
        reader.run_recv_worker();
        assert_eq!(events.lock().unwrap().cancels, 0);
        reader.delete().unwrap();
    }

    #[test]
    fn receives_over_udp() {
        use rand::Rng;

        // Pick a likely-free port, retrying in the style of ffmpeg's
        // default RTP range.
        let mut rng = rand::thread_rng();
        let port = (0..10)
            .map(|_| rng.gen_range(5000..65000))
            .find(|&p| std::net::UdpSocket::bind(("127.0.0.1", p)).is_ok())
            .expect("no free UDP port");

        let events = Arc::new(Mutex::new(Events::default()));
        let reader = StreamReader::new(
            StreamConfig {
                recv_addr: None,
                iface_addr: Some(Ipv4Addr::LOCALHOST),
                recv_port: port,
                recv_timeout: Duration::from_secs(1),
                max_packet_size: 0,
                insert_start_codes: false,
            },
            collector(events.clone(), |_| None),
            ReassemblyBuffer::with_capacity(4096),
            Box::new(7u32),
        )
        .unwrap();
        assert_eq!(reader.custom().downcast_ref::<u32>(), Some(&7));

        let recv_worker = {
            let reader = reader.clone();
            std::thread::spawn(move || reader.run_recv_worker())
        };
        let send_worker = {
            let reader = reader.clone();
            std::thread::spawn(move || reader.run_send_worker())
        };
        send_worker.join().unwrap();

        // Retry until the worker has bound and receives something.
        let socket = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let data = datagram(1, 90_000, true, b"\x41over the wire");
        let deadline = Instant::now() + Duration::from_secs(10);
        while events.lock().unwrap().completes.is_empty() {
            assert!(Instant::now() < deadline, "no NAL unit received");
            socket.send_to(&data, ("127.0.0.1", port)).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(events.lock().unwrap().completes[0].data, b"\x41over the wire");

        let stats = reader.monitoring(60_000_000).unwrap();
        assert!(stats.packets_received >= 1);
        assert_eq!(stats.mean_packet_size, 12 + 14);

        let handle = reader.clone().delete().expect_err("receive worker is running");
        reader.stop();
        recv_worker.join().unwrap();
        assert_eq!(events.lock().unwrap().cancels, 1);
        handle.delete().unwrap();
        reader.delete().unwrap();
    }
}

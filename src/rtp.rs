// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTP-style header carried on every datagram of the real-time stream.

use bytes::BufMut;

/// Length of the fixed header. The sender never appends CSRCs or extensions,
/// so unlike general RTP the payload always starts here.
pub const HEADER_LEN: usize = 12;

/// Converts a 90 kHz media timestamp to microseconds, rounding to nearest.
pub(crate) fn media_timestamp_to_micros(timestamp: u32) -> u64 {
    (u64::from(timestamp) * 1000 + 45) / 90
}

/// Borrowed view of a datagram with a validated header.
///
/// This follows the validate-then-access design of `rtp-rs`: construction
/// checks the length once, then accessors index into the raw bytes.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |             flags             |        sequence number        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       timestamp (90 kHz)                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            synchronization source (SSRC) identifier           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Bit 7 of the low flags byte is the marker, set on the last packet of an
/// access unit.
#[derive(Copy, Clone)]
pub struct PacketRef<'a>(&'a [u8]);

impl<'a> PacketRef<'a> {
    /// Validates a received datagram, or returns `None` if it is too short
    /// to hold a header. Callers discard short datagrams silently.
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(Self(data))
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.flags() & (1 << 7)) != 0
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.0[HEADER_LEN..]
    }
}

impl<'a> std::fmt::Debug for PacketRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRef")
            .field("sequence_number", &self.sequence_number())
            .field("timestamp", &self.timestamp())
            .field("ssrc", &self.ssrc())
            .field("mark", &self.mark())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// Builds datagrams as the sender would. Unstable; exposed for tests and
/// benchmarks.
#[doc(hidden)]
pub struct PacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub mark: bool,
}

impl PacketBuilder {
    pub fn build(self, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
        data.put_u16(if self.mark { 1 << 7 } else { 0 });
        data.put_u16(self.sequence_number);
        data.put_u32(self.timestamp);
        data.put_u32(self.ssrc);
        data.put_slice(payload);
        data
    }
}

// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receive-side reassembly for drone video streams.
//!
//! Two independent engines reconstruct video from unreliable datagram
//! networks:
//!
//! *   [`frame::FrameReader`] reassembles frames that were chopped into
//!     fixed-size fragments and tagged with a per-frame bitmap. The bitmap is
//!     continuously reported back through an external
//!     [`frame::DatagramManager`] so the sender can retransmit missing
//!     fragments.
//! *   [`stream::StreamReader`] reassembles an H.264 elementary stream
//!     delivered as an RTP-style unicast or multicast flow directly over UDP,
//!     handling single-NAL-unit, FU-A, and STAP-A payloads as specified in
//!     [RFC 6184](https://tools.ietf.org/html/rfc6184), and keeps
//!     per-interval reception statistics.
//!
//! Both engines write reassembled units into consumer-owned
//! [`ReassemblyBuffer`]s and hand them across a callback boundary; see the
//! module docs for the exact handoff contract. Workers are plain blocking
//! loops meant to run on caller-spawned threads, and every blocking call is
//! bounded (1 s / 500 ms / 1 ms) so a [`frame::FrameReader::stop`] or
//! [`stream::StreamReader::stop`] completes promptly.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;

mod error;
mod hex;
mod monitor;

pub use error::Error;
pub use monitor::MonitoringStats;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod buffer;
pub mod frame;
pub mod rtp;
pub mod stream;

pub use buffer::ReassemblyBuffer;

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting.
///
/// Currently this just allows formatting via `Debug` and `Display`.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

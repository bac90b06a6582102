// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Acknowledged fragmented-frame reception.
//!
//! The sender chops each frame into up-to-128 fragments of
//! [`wire::FRAGMENT_SIZE`] bytes and tags each with a [`wire::FragmentHeader`].
//! The reader assembles the current frame in a consumer-owned
//! [`ReassemblyBuffer`] while continuously reporting a per-frame
//! acknowledgement bitmap back through the [`DatagramManager`], so the sender
//! can retransmit just the missing fragments.
//!
//! A [`FrameReader`] runs two blocking workers on caller-spawned threads:
//!
//! *   the data worker ([`FrameReader::run_data_worker`]) reads fragments and
//!     upcalls the consumer at frame-complete boundaries, and
//! *   the ack worker ([`FrameReader::run_ack_worker`]) snapshots the bitmap
//!     roughly once per millisecond and hands it to the manager.
//!
//! ```no_run
//! use airstream::{frame, ReassemblyBuffer};
//! use std::sync::Arc;
//!
//! fn receive(manager: Arc<dyn frame::DatagramManager>) -> Result<(), airstream::Error> {
//!     let callback = Box::new(|event| match event {
//!         frame::FrameEvent::Complete { buf, len, missed_frames } => {
//!             log::info!("frame of {} bytes, {} frames missed before it", len, missed_frames);
//!             Some(buf) // reuse the same buffer for the next frame
//!         }
//!         frame::FrameEvent::TooSmall { len_so_far } => {
//!             Some(ReassemblyBuffer::with_capacity(2 * len_so_far.max(4096)))
//!         }
//!         frame::FrameEvent::CopyComplete { .. } | frame::FrameEvent::Cancel { .. } => None,
//!     });
//!     let reader = frame::FrameReader::new(
//!         manager,
//!         1, // data buffer id
//!         2, // ack buffer id
//!         callback,
//!         ReassemblyBuffer::with_capacity(128 * 1024),
//!     )?;
//!     let data = {
//!         let reader = reader.clone();
//!         std::thread::spawn(move || reader.run_data_worker())
//!     };
//!     let ack = {
//!         let reader = reader.clone();
//!         std::thread::spawn(move || reader.run_ack_worker())
//!     };
//!     // ... later:
//!     reader.stop();
//!     data.join().unwrap();
//!     ack.join().unwrap();
//!     reader.delete().unwrap();
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::buffer::ReassemblyBuffer;
use crate::error::ErrorInt;
use crate::Error;

pub mod wire;

pub use wire::{FragmentHeader, FrameAck};

use wire::{DATA_HEADER_LEN, FRAGMENT_SIZE, MAX_FRAGMENTS_PER_FRAME};

/// Bound on each data-worker read, so a stop request is observed promptly
/// even when no fragments arrive.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep between acknowledgement sends; the sender expects the latest bitmap
/// at roughly 1 kHz.
const ACK_INTERVAL: Duration = Duration::from_millis(1);

/// The external datagram manager the reader sits on. It owns the sockets and
/// retransmission machinery; the reader only reads fragments from one of its
/// input buffers and queues acknowledgements on one of its output buffers.
pub trait DatagramManager: Send + Sync {
    /// Reads one datagram from input buffer `buffer_id` into `buf`, blocking
    /// up to `timeout`. Timeouts surface as `ErrorKind::TimedOut` or
    /// `ErrorKind::WouldBlock` and are not logged by the reader.
    fn read_with_timeout(
        &self,
        buffer_id: i32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, std::io::Error>;

    /// Queues `data` for transmission on output buffer `buffer_id`.
    fn send(&self, buffer_id: i32, data: &[u8]) -> Result<(), std::io::Error>;
}

/// Datagram-manager I/O-buffer configuration for one direction of the video
/// transport. The constants chosen here are part of the protocol: the sender
/// configures its manager with the mirror image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoBufferParams {
    pub id: i32,

    /// Largest datagram a queue cell must hold.
    pub cell_size: usize,

    /// Queue depth, in cells.
    pub cells: usize,

    /// Whether a full queue overwrites the oldest entry instead of rejecting
    /// the new one.
    pub overwrite: bool,

    /// Delivery attempts per datagram; -1 means unbounded.
    pub retries: i32,
}

impl IoBufferParams {
    /// Configuration for the fragment input buffer: room for a whole frame's
    /// worth of fragments, no overwriting, single delivery (the ack bitmap
    /// drives retransmission, not the manager).
    pub fn video_data(id: i32) -> Self {
        Self {
            id,
            cell_size: FRAGMENT_SIZE + DATA_HEADER_LEN,
            cells: MAX_FRAGMENTS_PER_FRAME,
            overwrite: false,
            retries: 0,
        }
    }

    /// Configuration for the acknowledgement output buffer: a single
    /// overwritable cell, so the sender always sees the latest bitmap.
    pub fn video_ack(id: i32) -> Self {
        Self {
            id,
            cell_size: wire::ACK_PACKET_LEN,
            cells: 1,
            overwrite: true,
            retries: -1,
        }
    }
}

/// Upcall from the data worker to the consumer. The returned
/// `Option<ReassemblyBuffer>` hands the next buffer to the reader; its
/// meaning depends on the event, see each variant.
pub enum FrameEvent {
    /// Every fragment of the frame in `buf[..len]` has been received.
    /// `missed_frames` counts the frames wholly lost since the previously
    /// completed one, in wrapping 16-bit arithmetic. Return the buffer to
    /// fill next (commonly the same one).
    Complete {
        buf: ReassemblyBuffer,
        len: usize,
        missed_frames: u16,
    },

    /// The current buffer can no longer hold the frame being assembled;
    /// `len_so_far` bytes are accumulated. Return a larger buffer: the
    /// reader copies the accumulated prefix into it and keeps going. A
    /// refusal (`None`, or a grant smaller than `len_so_far`) abandons the
    /// rest of this frame; reassembly resumes at the next frame boundary.
    TooSmall { len_so_far: usize },

    /// The reader is done with `buf` after a [`FrameEvent::TooSmall`]
    /// exchange; its first `len` bytes were the accumulated prefix. The
    /// return value is ignored.
    CopyComplete { buf: ReassemblyBuffer, len: usize },

    /// The reader is shutting down and returns the in-progress buffer. The
    /// return value is ignored.
    Cancel { buf: ReassemblyBuffer, len: usize },
}

pub type FrameCallback = Box<dyn FnMut(FrameEvent) -> Option<ReassemblyBuffer> + Send>;

struct ThreadState {
    should_stop: bool,
    data_worker_started: bool,
    ack_worker_started: bool,
}

/// State touched only by the data worker; the mutex hands it to whichever
/// thread enters [`FrameReader::run_data_worker`].
struct DataState {
    buf: ReassemblyBuffer,
    len: usize,
    callback: FrameCallback,
}

struct Shared {
    manager: Arc<dyn DatagramManager>,
    data_buffer_id: i32,
    ack_buffer_id: i32,
    ack: Mutex<FrameAck>,
    data: Mutex<Option<DataState>>,
    threads: Mutex<ThreadState>,
}

/// Receiver for the acknowledged fragmented stream. Cheaply cloneable; clone
/// a handle per worker thread.
#[derive(Clone)]
pub struct FrameReader {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("data_buffer_id", &self.shared.data_buffer_id)
            .field("ack_buffer_id", &self.shared.ack_buffer_id)
            .finish_non_exhaustive()
    }
}

impl FrameReader {
    /// Creates a reader that assembles frames into `buf`, upcalling
    /// `callback` as described on [`FrameEvent`].
    pub fn new(
        manager: Arc<dyn DatagramManager>,
        data_buffer_id: i32,
        ack_buffer_id: i32,
        callback: FrameCallback,
        buf: ReassemblyBuffer,
    ) -> Result<Self, Error> {
        if buf.capacity() == 0 {
            bail!(ErrorInt::InvalidArgument(
                "frame buffer must have nonzero capacity".to_owned()
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                data_buffer_id,
                ack_buffer_id,
                ack: Mutex::new(FrameAck::new()),
                data: Mutex::new(Some(DataState {
                    buf,
                    len: 0,
                    callback,
                })),
                threads: Mutex::new(ThreadState {
                    should_stop: false,
                    data_worker_started: false,
                    ack_worker_started: false,
                }),
            }),
        })
    }

    fn should_stop(&self) -> bool {
        self.shared
            .threads
            .lock()
            .expect("thread state poisoned")
            .should_stop
    }

    /// Requests that both workers exit. Idempotent; each worker notices
    /// within its loop bound (1 s for data, ~1 ms for acks).
    pub fn stop(&self) {
        debug!("stopping frame reader...");
        self.shared
            .threads
            .lock()
            .expect("thread state poisoned")
            .should_stop = true;
    }

    /// Releases this handle. Refused (the handle is returned for a later
    /// retry) while either worker is still running; call
    /// [`FrameReader::stop`] and join the worker threads first.
    pub fn delete(self) -> Result<(), Self> {
        let can_delete = {
            let threads = self.shared.threads.lock().expect("thread state poisoned");
            !threads.data_worker_started && !threads.ack_worker_started
        };
        if can_delete {
            Ok(())
        } else {
            error!("frame reader still has running workers; stop it first");
            Err(self)
        }
    }

    /// Entry point for the data worker thread. Blocks until
    /// [`FrameReader::stop`]; on the way out, upcalls
    /// [`FrameEvent::Cancel`] with the in-progress buffer.
    pub fn run_data_worker(&self) {
        let mut state = match self
            .shared
            .data
            .lock()
            .expect("data state poisoned")
            .take()
        {
            Some(s) => s,
            None => {
                error!("frame data worker is already running; refusing to start again");
                return;
            }
        };
        let mut recv = vec![0u8; FRAGMENT_SIZE + DATA_HEADER_LEN];

        debug!("frame data worker running");
        self.shared
            .threads
            .lock()
            .expect("thread state poisoned")
            .data_worker_started = true;

        let mut previous_frame = u16::MAX;
        let mut skip_current_frame = false;
        while !self.should_stop() {
            match self.shared.manager.read_with_timeout(
                self.shared.data_buffer_id,
                &mut recv,
                READ_TIMEOUT,
            ) {
                Ok(n) => self.process_fragment(
                    &mut state,
                    &mut previous_frame,
                    &mut skip_current_frame,
                    &recv[..n],
                ),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) => {}
                Err(e) => warn!("error reading video data: {e}"),
            }
        }

        let DataState {
            buf,
            len,
            mut callback,
        } = state;
        callback(FrameEvent::Cancel { buf, len });
        *self.shared.data.lock().expect("data state poisoned") = Some(DataState {
            buf: ReassemblyBuffer::empty(),
            len: 0,
            callback,
        });

        debug!("frame data worker ended");
        self.shared
            .threads
            .lock()
            .expect("thread state poisoned")
            .data_worker_started = false;
    }

    fn process_fragment(
        &self,
        state: &mut DataState,
        previous_frame: &mut u16,
        skip_current_frame: &mut bool,
        datagram: &[u8],
    ) {
        let header = match FragmentHeader::parse(datagram) {
            Some(h) => h,
            None => {
                debug!(
                    "discarding {} byte datagram, shorter than a fragment header",
                    datagram.len()
                );
                return;
            }
        };
        let payload = &datagram[DATA_HEADER_LEN..];

        {
            let mut ack = self.shared.ack.lock().expect("ack packet poisoned");
            if u32::from(header.frame_number) != ack.frame_number() {
                // The wire numbering is authoritative: any change starts a
                // new frame, there is no history beyond one.
                *skip_current_frame = false;
                state.len = 0;
                ack.set_frame_number(header.frame_number);
                ack.reset();
            }
            ack.set(header.fragment_number);
        }

        let cp_index = usize::from(header.fragment_number) * FRAGMENT_SIZE;
        let end_index = cp_index + payload.len();

        // Grow until the fragment fits. A refused grant, or one smaller than
        // what's already accumulated, abandons the rest of this frame.
        while end_index > state.buf.capacity() && !*skip_current_frame {
            let next = (state.callback)(FrameEvent::TooSmall {
                len_so_far: state.len,
            });
            let mut next = next.unwrap_or_else(ReassemblyBuffer::empty);
            if next.capacity() >= state.len {
                next[..state.len].copy_from_slice(&state.buf[..state.len]);
            } else {
                *skip_current_frame = true;
            }
            let old = std::mem::replace(&mut state.buf, next);
            (state.callback)(FrameEvent::CopyComplete {
                buf: old,
                len: state.len,
            });
        }
        if *skip_current_frame {
            return;
        }

        state.buf[cp_index..end_index].copy_from_slice(payload);
        if end_index > state.len {
            state.len = end_index;
        }

        let complete = {
            let ack = self.shared.ack.lock().expect("ack packet poisoned");
            ack.all_set(header.fragments_per_frame) && header.frame_number != *previous_frame
        };
        if complete {
            debug!("all fragments received for frame {}", header.frame_number);
            let missed_frames = header
                .frame_number
                .wrapping_sub(*previous_frame)
                .wrapping_sub(1);
            if missed_frames != 0 {
                debug!("missed {missed_frames} frames");
            }
            *previous_frame = header.frame_number;
            let len = state.len;
            let buf = std::mem::replace(&mut state.buf, ReassemblyBuffer::empty());
            let next = (state.callback)(FrameEvent::Complete {
                buf,
                len,
                missed_frames,
            });
            state.buf = next.unwrap_or_else(ReassemblyBuffer::empty);
        }
    }

    /// Entry point for the ack worker thread. Blocks until
    /// [`FrameReader::stop`].
    pub fn run_ack_worker(&self) {
        debug!("ack sender worker running");
        self.shared
            .threads
            .lock()
            .expect("thread state poisoned")
            .ack_worker_started = true;

        while !self.should_stop() {
            std::thread::sleep(ACK_INTERVAL);
            let packet = self.shared.ack.lock().expect("ack packet poisoned").encode();
            if let Err(e) = self
                .shared
                .manager
                .send(self.shared.ack_buffer_id, &packet)
            {
                warn!("error sending video ack: {e}");
            }
        }

        debug!("ack sender worker ended");
        self.shared
            .threads
            .lock()
            .expect("thread state poisoned")
            .ack_worker_started = false;
    }
}

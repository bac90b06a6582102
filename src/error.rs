// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, net::SocketAddr, sync::Arc};

use crate::WallTime;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; where an error concerns
/// a particular socket or datagram, the message carries enough context to
/// find it in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns true if the error was caused by an invalid caller-supplied
    /// argument, including monitoring queries against an empty ring.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::InvalidArgument(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Error binding receive socket {addr}: {source}\n\nat: {when}")]
    BindError {
        addr: SocketAddr,
        when: WallTime,
        source: std::io::Error,
    },
}

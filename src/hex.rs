// Copyright (C) 2023 the airstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for logging dropped or malformed datagrams.

use pretty_hex::PrettyHex;

/// Wraps a byte slice so `Debug` prints at most `max_bytes` of hex dump,
/// noting how much was omitted.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = &self.inner[..self.inner.len().min(self.max_bytes)];
        write!(
            f,
            "{} bytes: {:?}",
            self.inner.len(),
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ascii: false,
                width: 0,
                group: 0,
                ..Default::default()
            })
        )?;
        if self.inner.len() > self.max_bytes {
            write!(f, " ...")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn truncates() {
        let out = format!("{:?}", LimitedHex::new(&[0xab; 8], 4));
        assert!(out.starts_with("8 bytes:"), "{out}");
        assert!(out.ends_with("..."), "{out}");
        let out = format!("{:?}", LimitedHex::new(&[0xab; 4], 4));
        assert!(!out.ends_with("..."), "{out}");
    }
}

// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error handling: a single error type classified by a closed set of kinds.

use std::fmt;

/// Error kind.
///
/// Most kinds correspond to a condition in the TPS container engine;
/// `InvalidArgument` and `Internal` cover the outer layers (CLI, control
/// channel).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The master index is missing or unopenable at load.
    PathUnreadable,

    /// A master or frame-index magic mismatch; wrong file, unplayable.
    BadMagic,

    /// No catalogued segment covers the requested (time, channel).
    SegmentNotFound,

    /// The header search window contained no VPS/SPS/PPS/IDR quadruple.
    NoVideoHeader,

    /// The demuxer couldn't find two complete NAL units in a corrupt region.
    StreamStall,

    /// Underlying I/O failure.
    ReadError,

    /// The cancellation flag was observed.
    Cancelled,

    /// A caller-supplied argument was malformed.
    InvalidArgument,

    /// A supposedly-impossible condition.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PathUnreadable => "path unreadable",
            ErrorKind::BadMagic => "bad magic",
            ErrorKind::SegmentNotFound => "segment not found",
            ErrorKind::NoVideoHeader => "no video header",
            ErrorKind::StreamStall => "stream stall",
            ErrorKind::ReadError => "read error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// An error with a kind, an optional message, and an optional source.
///
/// Construct via the [`err!`](crate::err) and [`bail!`](crate::bail) macros;
/// annotate foreign errors via [`ResultExt::err_kind`].
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedSource>,
}

impl Error {
    #[doc(hidden)]
    pub fn build(kind: ErrorKind, msg: Option<String>, source: Option<BoxedSource>) -> Self {
        Error { kind, msg, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns a `Display` adapter which writes the error and all its sources.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::ReadError,
            msg: None,
            source: Some(Box::new(e)),
        }
    }
}

/// See [`Error::chain`].
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut cur: Option<&(dyn std::error::Error + 'static)> =
            self.0.source.as_ref().map(|e| &**e as _);
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedSource>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error {
            kind: k,
            msg: None,
            source: Some(e.into()),
        })
    }
}

/// Constructs an [`Error`], tersely.
///
/// The first argument is an [`ErrorKind`] variant name; the rest is an
/// optional `msg(...)` format string and an optional `source(...)` cause:
///
/// ```
/// use tpsview_base::{err, ErrorKind};
/// let off = 42;
/// let e = err!(BadMagic, msg("bad magic at offset {off}"));
/// assert_eq!(e.kind(), ErrorKind::BadMagic);
/// assert_eq!(e.to_string(), "bad magic: bad magic at offset 42");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::build($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::build($crate::ErrorKind::$kind, Some(format!($($msg)*)), None)
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::Error::build(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some(::std::boxed::Box::new($source)),
        )
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::build(
            $crate::ErrorKind::$kind,
            None,
            Some(::std::boxed::Box::new($source)),
        )
    };
}

/// Like [`err!`], but returns the error from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_kind() {
        let e = err!(SegmentNotFound, msg("no segment for channel {}", 2));
        assert_eq!(e.kind(), ErrorKind::SegmentNotFound);
        assert_eq!(e.to_string(), "segment not found: no segment for channel 2");
    }

    #[test]
    fn chain_walks_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let e = err!(ReadError, msg("short read"), source(io));
        assert_eq!(e.chain().to_string(), "read error: short read: eof");
    }

    #[test]
    fn err_kind_annotates() {
        let r: Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        let e = r.err_kind(ErrorKind::Internal).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert_eq!(e.chain().to_string(), "internal error: boom");
    }
}

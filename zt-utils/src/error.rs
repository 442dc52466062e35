// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::fmt::{Display, Formatter};

/// Abstract error taxonomy shared by every public operation in the workspace.
///
/// These are the kinds from the spec's error handling design: application code
/// (and the FFI layer) only ever observes one of these, never a raw stack
/// errno or std::io::Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZtError {
    Ok,
    InvalidArg,
    BadFd,
    Service,
    InvalidOp,
    NoResult,
    ResourceExhausted,
    NoRoute,
    WouldBlock,
    Timeout,
    NotConnected,
    ConnRefused,
    Reset,
    BrokenPipe,
    NoProtoOpt,
    General,
    Unrecoverable,
}

impl ZtError {
    /// True for the small set of results that should bring the node service down.
    #[inline(always)]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ZtError::Unrecoverable)
    }
}

impl Display for ZtError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ZtError::Ok => "ok",
            ZtError::InvalidArg => "invalid argument",
            ZtError::BadFd => "bad file descriptor",
            ZtError::Service => "service not running",
            ZtError::InvalidOp => "invalid operation for current state",
            ZtError::NoResult => "no result",
            ZtError::ResourceExhausted => "resource exhausted",
            ZtError::NoRoute => "no route",
            ZtError::WouldBlock => "would block",
            ZtError::Timeout => "timed out",
            ZtError::NotConnected => "not connected",
            ZtError::ConnRefused => "connection refused",
            ZtError::Reset => "connection reset",
            ZtError::BrokenPipe => "broken pipe",
            ZtError::NoProtoOpt => "unsupported protocol option",
            ZtError::General => "general stack error",
            ZtError::Unrecoverable => "unrecoverable service error",
        })
    }
}

impl std::error::Error for ZtError {}

/// Lightweight invalid-parameter error for constructors, matching the teacher's
/// hand-rolled `InvalidParameterError` rather than a derive-macro error crate.
#[derive(Debug, Clone, Copy)]
pub struct InvalidParameterError(pub &'static str);

impl Display for InvalidParameterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for InvalidParameterError {}

pub type Result<T> = std::result::Result<T, ZtError>;

//! Crate level error type and configuration validation

pub use crate::{dispatch::DispatchError, packet::PacketError, packet::csum::ChecksumError};
use std::fmt;

/// The union of every failure the crate can report
pub enum Error {
    /// Invalid pipeline configuration
    Cfg(ConfigError),
    /// Invalid packet access or resize
    Packet(PacketError),
    /// Invalid incremental checksum update
    Checksum(ChecksumError),
    /// Invalid stage registration or transfer
    Dispatch(DispatchError),
}

impl Error {
    /// Gets a static string description of the error
    #[inline]
    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::Cfg(_) => "configuration error",
            Self::Packet(err) => err.discriminant(),
            Self::Checksum(err) => err.discriminant(),
            Self::Dispatch(err) => err.discriminant(),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cfg(err) => Some(err),
            Self::Packet(err) => Some(err),
            Self::Checksum(err) => Some(err),
            Self::Dispatch(err) => Some(err),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cfg(cerr) => {
                write!(f, "configuration error: {cerr:?}")
            }
            Self::Packet(perr) => {
                write!(f, "packet error: {perr:?}")
            }
            Self::Checksum(cerr) => {
                write!(f, "checksum error: {cerr:?}")
            }
            Self::Dispatch(derr) => {
                write!(f, "dispatch error: {derr:?}")
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cfg(cerr) => {
                write!(f, "configuration error: {cerr}")
            }
            Self::Packet(perr) => {
                write!(f, "packet error: {perr}")
            }
            Self::Checksum(cerr) => {
                write!(f, "checksum error: {cerr}")
            }
            Self::Dispatch(derr) => {
                write!(f, "dispatch error: {derr}")
            }
        }
    }
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Self::Cfg(value)
    }
}

impl From<PacketError> for Error {
    fn from(value: PacketError) -> Self {
        Self::Packet(value)
    }
}

impl From<ChecksumError> for Error {
    fn from(value: ChecksumError) -> Self {
        Self::Checksum(value)
    }
}

impl From<DispatchError> for Error {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

/// A configuration value that failed validation
#[derive(Debug)]
pub struct ConfigError {
    /// The name of the offending field
    pub name: &'static str,
    /// Why the value was rejected
    pub kind: ConfigErrorKind,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is invalid: ", self.name)?;

        match &self.kind {
            ConfigErrorKind::OutOfRange { size, range } => {
                write!(f, "value '{size}' was out of range '{range:?}'")
            }
            ConfigErrorKind::Unregistered { index } => {
                write!(f, "stage {index} has not been registered")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// The reason a [`ConfigError`] was raised
#[derive(Debug)]
pub enum ConfigErrorKind {
    /// The value must lie within `range`
    OutOfRange {
        /// The rejected value
        size: usize,
        /// The accepted range
        range: std::ops::Range<usize>,
    },
    /// The value names a stage slot that is empty in the dispatch table
    Unregistered {
        /// The stage index
        index: u32,
    },
}

/// Returns a [`ConfigError`] from the enclosing function if the field is
/// outside the range
#[macro_export]
macro_rules! within_range {
    ($ctx:expr, $name:ident, $range:expr) => {{
        let val = $ctx.$name;
        let uval = val as usize;

        if !$range.contains(&uval) {
            return Err($crate::error::ConfigError {
                name: stringify!($name),
                kind: $crate::error::ConfigErrorKind::OutOfRange {
                    size: uval,
                    range: $range,
                },
            }
            .into());
        }

        val
    }};
}

use std::fmt::{Debug, Display};
use std::sync::PoisonError;
use std::{fmt, io, result};

/// The full error taxonomy of the fabric. Every fallible public operation
/// (`put`, `next`, `call_sync`, `add_node`, ...) returns one of these kinds;
/// none of them are ever silently swallowed inside the core.
#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>, // boxed to keep Result<T> small
}

#[derive(Debug)]
pub enum ErrorKind {
    /// Duplicate registration, missing name, type-handle mismatch, unique
    /// constraint violation, manager re-instantiation.
    Management(String),
    /// `latest`/`next` on a receiver whose topic was flushed or never written.
    TopicNoData(String),
    /// Client call with no registered server, or the server disappeared mid-call.
    ServiceUnavailable(String),
    /// Synchronous call exceeded its timeout.
    ServiceTimeout(String),
    /// `move` called without a move-adapter, or the adapter rejected the value.
    Conversion(String),
    /// Ring size below minimum, unknown clock mode name.
    InvalidArgument(String),
    /// Time regression, use-before-init, unsupported mode at runtime.
    Clock(String),
    /// A mutex was poisoned by a panicking thread.
    Poisoned,
    /// Underlying OS or file-descriptor error.
    Io(io::Error),
    /// The config file could not be parsed as YAML.
    ConfigParse(serde_yaml::Error),
    /// A config value did not hold the type the caller asked for.
    ConfigAccess(String),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn management<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::Management(s.to_string())) }
    }

    pub fn topic_no_data<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::TopicNoData(s.to_string())) }
    }

    pub fn service_unavailable<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::ServiceUnavailable(s.to_string())) }
    }

    pub fn service_timeout<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::ServiceTimeout(s.to_string())) }
    }

    pub fn conversion<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::Conversion(s.to_string())) }
    }

    pub fn invalid_argument<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::InvalidArgument(s.to_string())) }
    }

    pub fn clock<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::Clock(s.to_string())) }
    }

    pub fn config_access<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::ConfigAccess(s.to_string())) }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error { err: Box::new(ErrorKind::Io(err)) }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error { err: Box::new(ErrorKind::ConfigParse(err)) }
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error { err: Box::new(ErrorKind::Poisoned) }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Management(s) => write!(f, "management error: {s}"),
            ErrorKind::TopicNoData(s) => write!(f, "no data available: {s}"),
            ErrorKind::ServiceUnavailable(s) => write!(f, "service unavailable: {s}"),
            ErrorKind::ServiceTimeout(s) => write!(f, "service timeout: {s}"),
            ErrorKind::Conversion(s) => write!(f, "conversion error: {s}"),
            ErrorKind::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
            ErrorKind::Clock(s) => write!(f, "clock error: {s}"),
            ErrorKind::Poisoned => f.write_str("another thread panicked while holding the lock"),
            ErrorKind::Io(e) => Display::fmt(e, f),
            ErrorKind::ConfigParse(e) => Display::fmt(e, f),
            ErrorKind::ConfigAccess(s) => write!(f, "config access error: {s}"),
        }
    }
}

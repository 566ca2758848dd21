//! Result codes.
//!
//! Every fallible entry point returns [`Result`]. Each [`Error`] variant carries
//! a stable signed code (see [`Error::code`]) so callers that speak the numeric
//! taxonomy can round-trip through [`Error::from_code`]. Success is `Ok`, code `0`.

/// Errors reported by the engine, the node graph and the resource manager.
///
/// `Error` is `Copy`: it is stored on resource entries and produced on the
/// render thread, neither of which may allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    #[error("generic error")]
    Generic,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of range")]
    OutOfRange,
    #[error("access denied")]
    AccessDenied,
    #[error("does not exist")]
    DoesNotExist,
    #[error("already exists")]
    AlreadyExists,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("invalid file")]
    InvalidFile,
    #[error("too big")]
    TooBig,
    #[error("at end")]
    AtEnd,
    #[error("no space")]
    NoSpace,
    #[error("busy")]
    Busy,
    #[error("i/o error")]
    IoError,
    #[error("interrupted")]
    Interrupt,
    #[error("unavailable")]
    Unavailable,
    #[error("already in use")]
    AlreadyInUse,
    #[error("bad seek")]
    BadSeek,
    #[error("deadlock")]
    Deadlock,
    #[error("not implemented")]
    NotImplemented,
    #[error("no data available")]
    NoDataAvailable,
    #[error("invalid data")]
    InvalidData,
    #[error("timed out")]
    Timeout,
    #[error("in progress")]
    InProgress,
    #[error("cancelled")]
    Cancelled,

    #[error("crc mismatch")]
    CrcMismatch,

    #[error("format not supported")]
    FormatNotSupported,
    #[error("device type not supported")]
    DeviceTypeNotSupported,
    #[error("share mode not supported")]
    ShareModeNotSupported,
    #[error("no backend")]
    NoBackend,
    #[error("no device")]
    NoDevice,
    #[error("api not found")]
    ApiNotFound,
    #[error("invalid device config")]
    InvalidDeviceConfig,
    #[error("loop")]
    Loop,
    #[error("backend not enabled")]
    BackendNotEnabled,

    #[error("device not initialized")]
    DeviceNotInitialized,
    #[error("device already initialized")]
    DeviceAlreadyInitialized,
    #[error("device not started")]
    DeviceNotStarted,
    #[error("device not stopped")]
    DeviceNotStopped,

    #[error("failed to initialize backend")]
    FailedToInitBackend,
    #[error("failed to open backend device")]
    FailedToOpenBackendDevice,
    #[error("failed to start backend device")]
    FailedToStartBackendDevice,
    #[error("failed to stop backend device")]
    FailedToStopBackendDevice,
}

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Code returned for success by code-based callers.
pub const SUCCESS: i32 = 0;

const CODES: &[(Error, i32)] = &[
    (Error::Generic, -1),
    (Error::InvalidArgs, -2),
    (Error::InvalidOperation, -3),
    (Error::OutOfMemory, -4),
    (Error::OutOfRange, -5),
    (Error::AccessDenied, -6),
    (Error::DoesNotExist, -7),
    (Error::AlreadyExists, -8),
    (Error::TooManyOpenFiles, -9),
    (Error::InvalidFile, -10),
    (Error::TooBig, -11),
    (Error::AtEnd, -17),
    (Error::NoSpace, -18),
    (Error::Busy, -19),
    (Error::IoError, -20),
    (Error::Interrupt, -21),
    (Error::Unavailable, -22),
    (Error::AlreadyInUse, -23),
    (Error::BadSeek, -25),
    (Error::Deadlock, -27),
    (Error::NotImplemented, -29),
    (Error::NoDataAvailable, -32),
    (Error::InvalidData, -33),
    (Error::Timeout, -34),
    (Error::InProgress, -50),
    (Error::Cancelled, -51),
    (Error::CrcMismatch, -100),
    (Error::FormatNotSupported, -200),
    (Error::DeviceTypeNotSupported, -201),
    (Error::ShareModeNotSupported, -202),
    (Error::NoBackend, -203),
    (Error::NoDevice, -204),
    (Error::ApiNotFound, -205),
    (Error::InvalidDeviceConfig, -206),
    (Error::Loop, -207),
    (Error::BackendNotEnabled, -208),
    (Error::DeviceNotInitialized, -300),
    (Error::DeviceAlreadyInitialized, -301),
    (Error::DeviceNotStarted, -302),
    (Error::DeviceNotStopped, -303),
    (Error::FailedToInitBackend, -400),
    (Error::FailedToOpenBackendDevice, -401),
    (Error::FailedToStartBackendDevice, -402),
    (Error::FailedToStopBackendDevice, -403),
];

impl Error {
    /// The signed result code for this error. Always negative.
    pub fn code(self) -> i32 {
        CODES
            .iter()
            .find(|(e, _)| *e == self)
            .map(|&(_, c)| c)
            .unwrap_or(-1)
    }

    /// Map a signed result code back to an error.
    ///
    /// Returns `None` for `0` (success) and for codes outside the taxonomy.
    pub fn from_code(code: i32) -> Option<Error> {
        CODES.iter().find(|&&(_, c)| c == code).map(|&(e, _)| e)
    }

    /// True for errors in the device-state range (`-300..=-303`).
    pub fn is_device_state(self) -> bool {
        (-303..=-300).contains(&self.code())
    }

    /// True for errors in the backend-operation range (`-400..=-403`).
    pub fn is_backend_failure(self) -> bool {
        (-403..=-400).contains(&self.code())
    }
}

/// Convert a `Result<()>` into the signed code taxonomy.
pub fn result_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => SUCCESS,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for &(err, code) in CODES {
            assert!(code < 0);
            assert_eq!(err.code(), code);
            assert_eq!(Error::from_code(code), Some(err));
        }
        assert_eq!(Error::from_code(SUCCESS), None);
        assert_eq!(Error::from_code(-9999), None);
    }

    #[test]
    fn ranges() {
        assert_eq!(Error::CrcMismatch.code(), -100);
        assert!(Error::DeviceNotStarted.is_device_state());
        assert!(!Error::Busy.is_device_state());
        assert!(Error::FailedToStartBackendDevice.is_backend_failure());
        assert_eq!(result_code(Ok(())), 0);
        assert_eq!(result_code(Err(Error::InvalidOperation)), -3);
    }
}

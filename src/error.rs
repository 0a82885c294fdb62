//! Every error that can occur in tyrs.

use std::cell::RefCell;

/// Alias to simplify implementing the results of tyrs functions.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure; every [Error] carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocation failed.
    Memory,
    /// Caller-supplied argument violates a precondition.
    Param,
    /// Feature not available on this platform, or disabled by configuration.
    Unsupported,
    /// Device, path, or firmware format not present.
    NotFound,
    /// Object already present where uniqueness is required.
    Exists,
    /// Permission denied by the OS.
    Access,
    /// Resource temporarily contended (e.g. the board is running another task).
    Busy,
    /// Read/write failure on a device.
    Io,
    /// Wait elapsed.
    Timeout,
    /// The requested capability is not offered by the board's current interfaces.
    Mode,
    /// Value out of bounds (e.g. firmware too big for the model's flash).
    Range,
    /// OS call failed unexpectedly.
    System,
    /// Malformed file or descriptor.
    Parse,
    /// Firmware image is not compatible with the detected model.
    Firmware,
    /// Last resort.
    Other,
}

impl ErrorKind {
    /// Generic description, used when an error is raised without its own message.
    pub fn generic_message(self) -> &'static str {
        use ErrorKind::*;

        match self {
            Memory => "Memory error",
            Param => "Incorrect parameter",
            Unsupported => "Option not supported",
            NotFound => "Not found",
            Exists => "Already exists",
            Access => "Permission error",
            Busy => "Busy error",
            Io => "I/O error",
            Timeout => "Timeout error",
            Mode => "Wrong mode",
            Range => "Out of range error",
            System => "System error",
            Parse => "Parse error",
            Firmware => "Firmware error",
            Other => "Unknown error",
        }
    }
}

/// A classified failure with a human-readable message.
///
/// Creating an error records its message in a thread-local buffer (see
/// [last_error_message]) and reports it on the message pipeline, unless the
/// kind is currently masked on this thread.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let err = Error {
            kind,
            message: message.into(),
        };
        err.report();
        err
    }

    /// Builds an error carrying the kind's generic description.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Error::new(kind, kind.generic_message())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn report(&self) {
        LAST_ERROR.with(|last| *last.borrow_mut() = self.message.clone());

        if !is_masked(self.kind) {
            crate::message::error(self.kind, &self.message);
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let kind = match err.kind() {
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::Access,
            Io::AlreadyExists => ErrorKind::Exists,
            Io::TimedOut => ErrorKind::Timeout,
            Io::InvalidInput => ErrorKind::Param,
            Io::OutOfMemory => ErrorKind::Memory,
            Io::BrokenPipe | Io::ConnectionReset | Io::UnexpectedEof => ErrorKind::Io,
            _ => ErrorKind::System,
        };

        Error::new(kind, err.to_string())
    }
}

thread_local! {
    static MASK: RefCell<Vec<ErrorKind>> = const { RefCell::new(Vec::new()) };
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Pushes `kind` on this thread's mask stack: errors of that kind are still
/// returned but stay off the message pipeline until [unmask] pops it.
pub fn mask(kind: ErrorKind) {
    MASK.with(|mask| mask.borrow_mut().push(kind));
}

/// Pops the most recent [mask] entry.
pub fn unmask() {
    MASK.with(|mask| {
        mask.borrow_mut()
            .pop()
            .expect("unbalanced error mask stack");
    });
}

pub fn is_masked(kind: ErrorKind) -> bool {
    MASK.with(|mask| mask.borrow().contains(&kind))
}

/// Runs `f` with `kind` masked, so expected failures do not pollute the logs.
///
/// The scoped form callers should prefer over raw [mask]/[unmask] pairs.
pub fn allow<T>(kind: ErrorKind, f: impl FnOnce() -> Result<T>) -> Result<T> {
    struct Unmask;
    impl Drop for Unmask {
        fn drop(&mut self) {
            unmask();
        }
    }

    mask(kind);
    let _guard = Unmask;
    f()
}

/// Returns the message of the most recent error raised on this thread.
pub fn last_error_message() -> String {
    LAST_ERROR.with(|last| last.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_message_tracks_most_recent_error() {
        let _ = Error::new(ErrorKind::Io, "first failure");
        let _ = Error::new(ErrorKind::Busy, "second failure");
        assert_eq!(last_error_message(), "second failure");
    }

    #[test]
    fn allow_masks_only_inside_the_scope() {
        assert!(!is_masked(ErrorKind::NotFound));

        let r: Result<()> = allow(ErrorKind::NotFound, || {
            assert!(is_masked(ErrorKind::NotFound));
            Err(Error::new(ErrorKind::NotFound, "expected miss"))
        });

        assert_eq!(r.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(!is_masked(ErrorKind::NotFound));
    }

    #[test]
    fn masked_errors_are_still_returned() {
        let err = allow(ErrorKind::Timeout, || -> Result<()> {
            Err(Error::from_kind(ErrorKind::Timeout))
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.message(), "Timeout error");
    }

    #[test]
    fn io_errors_map_to_matching_kinds() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.kind(), ErrorKind::Access);

        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Failures fall into three families, mirroring the error policy of the runtime:
///
/// ## Wire and Decode Errors
/// - [`Error::Malformed`] - Corrupted or truncated wire data
/// - [`Error::OutOfBounds`] - Attempted to read beyond a buffer boundary
///
/// ## Host Interaction Errors
/// - [`Error::Host`] - The profiling host returned a failing HRESULT
/// - [`Error::RewriterUnavailable`] - The IL-rewriter callback was never injected
///
/// ## Runtime State Errors
/// - [`Error::UntrackedThread`] - A stack operation was issued on a thread with no tracker slot
/// - [`Error::NotConfigured`] - A required piece of configuration was never delivered
/// - [`Error::NotInstalled`] - The profiler singleton has not been installed
/// - [`Error::LockError`] - Thread synchronization failure
/// - [`Error::FileError`] - Filesystem I/O errors (exception sidecar)
///
/// Note that conditions fatal to the run (stack imbalance at `LeaveMain`,
/// path divergence) do not surface here at all: probe entry points abort the
/// process instead of unwinding into managed code.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire data is damaged and could not be decoded.
    ///
    /// The error includes the source location where the malformation was
    /// detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file in which the error was detected
    /// * `line` - Source line in which the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while decoding a buffer.
    ///
    /// This is a safety check to prevent reads past the end of wire data
    /// handed over by the consumer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The profiling host returned a failing HRESULT.
    ///
    /// Wraps any non-success result from the host's metadata and introspection
    /// surface (function info, module info, signature token emission, ReJIT
    /// requests). The raw HRESULT is preserved for diagnostics.
    #[error("Profiling host failed during {context} - HRESULT 0x{hr:08x}")]
    Host {
        /// Which host operation failed
        context: &'static str,
        /// The raw HRESULT reported by the host
        hr: i32,
    },

    /// The external IL-rewriter callback has not been injected.
    ///
    /// Instrumentation cannot proceed until the host delivers the rewrite
    /// entry point via `SyncInfoGettersPointers`.
    #[error("IL rewriter callback is not available")]
    RewriterUnavailable,

    /// A stack operation was issued on a thread that has no tracker slot.
    #[error("Operation requires a tracked thread")]
    UntrackedThread,

    /// A required piece of configuration was never delivered.
    ///
    /// The associated string names the missing item (e.g. the entry-main
    /// identity expected from `SetEntryMain`).
    #[error("Missing configuration - {0}")]
    NotConfigured(&'static str),

    /// The profiler singleton has not been installed.
    #[error("Profiler is not installed")]
    NotInstalled,

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// when trying to acquire a mutex or rwlock that is in an invalid state.
    #[error("Failed to lock target")]
    LockError,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors raised while writing the uncatchable-exception
    /// sidecar file.
    #[error("{0}")]
    FileError(#[from] std::io::Error),
}

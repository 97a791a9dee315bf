use std::fmt;

/// Errors reported by the runtime facade and the platform adapter.
///
/// Errors are coarse by design: the runtime either refuses to come up
/// (`Inval`, `Excl`), could not probe the platform (`Fail`), or failed a
/// single non-fatal affinity call (`Assign`). Everything else is a
/// programmer contract violation and handled with debug assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The configuration passed to `Lpel::init` is invalid.
    Inval,
    /// A platform probe (CPU count, capability check) failed.
    Fail,
    /// Binding a thread's CPU affinity failed. Non-fatal per call.
    Assign,
    /// Exclusive (real-time) mode was requested but the process lacks
    /// the capability to enter a real-time scheduling class.
    Excl,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inval => write!(f, "invalid runtime configuration"),
            Self::Fail => write!(f, "platform capability probe failed"),
            Self::Assign => write!(f, "could not set thread CPU affinity"),
            Self::Excl => write!(f, "real-time scheduling not permitted"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

use crate::StoreError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for builders and engines.
///
/// Lifecycle errors (`NotPrepared`, `Closed`) are rejected synchronously
/// without touching the store and are recoverable by correct call
/// sequencing. `IdExhausted` and `LimitReached` are terminal for the
/// affected domain: the former until a new engine (typically a process
/// restart) obtains a fresh lease, the latter permanently.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The builder has not been prepared yet; call [`prepare`] first.
    ///
    /// [`prepare`]: crate::Builder::prepare
    #[error("builder has not been prepared; call prepare first")]
    NotPrepared,

    /// The builder has been destroyed; no further operations are possible.
    #[error("builder has been destroyed")]
    Closed,

    /// The active segment is consumed and no renewed segment is available.
    ///
    /// Renewal already exhausted its retry budget when this surfaces, so the
    /// domain will keep reporting this error until a fresh engine obtains a
    /// new lease.
    #[error("id segment exhausted and no renewed segment is available")]
    IdExhausted,

    /// The configured limitation ceiling was reached for this domain.
    #[error("configured id limitation reached")]
    LimitReached,

    /// The lease store reported a failure outside a renewal (e.g. during
    /// [`prepare`] or [`destroy`]).
    ///
    /// [`prepare`]: crate::Builder::prepare
    /// [`destroy`]: crate::Builder::destroy
    #[error("lease store error: {0}")]
    Store(#[from] StoreError),
}

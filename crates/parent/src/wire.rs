//! Wire codes and error taxonomy (spec.md §6 "Parent-protocol wire codes").

use thiserror::Error;

/// Fixed small-integer operation codes, exactly as spec.md lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    Open = 2,
    Close = 3,
    GetPortal = 4,
    Register = 5,
    Unregister = 6,
    GetQuota = 7,
    Singleton = 8,
    ReqKill = 9,
    Signal = 10,
}

/// Error taxonomy returned in the first reply word. Distinct from the
/// internal `thiserror` error types the rest of this stack uses
/// (`RegistryError`, `CapError`, `KernelError`): this is the wire-visible
/// client-facing vocabulary spec.md §7 describes, and every internal error
/// converts into one of these seven codes at the dispatch boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProtoError {
    #[error("operation succeeded")]
    None = 0,
    #[error("client violated the wire protocol")]
    Proto = 1,
    #[error("permission denied")]
    Perm = 2,
    #[error("transient pressure, back off and retry")]
    Retry = 3,
    #[error("operation aborted")]
    Abort = 4,
    #[error("resource exhausted")]
    Resource = 5,
    #[error("entry already exists")]
    Exists = 6,
}

impl From<registry::RegistryError> for ProtoError {
    fn from(e: registry::RegistryError) -> Self {
        match e {
            registry::RegistryError::NotFound => ProtoError::Proto,
            registry::RegistryError::NoResource => ProtoError::Resource,
        }
    }
}

impl From<captable::CapError> for ProtoError {
    fn from(_: captable::CapError) -> Self {
        ProtoError::Resource
    }
}

/// The error type used by the stack walker.
///
/// A walk that merely reaches the end of the stack is not an error; the
/// frame iterator completes with `Ok(None)` in that case. Errors are
/// reserved for walks that could not start or had to be cut short.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("The CPU context has no valid instruction pointer")]
    InvalidContext,

    #[error("The frame limit was reached, remaining frames were dropped")]
    FrameLimitReached,
}

/// Errors from loading a module in its serialized (packed) form.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedError {
    #[error("Packed module data is shorter than its header")]
    Truncated,

    #[error("Packed module header has the wrong magic number")]
    BadMagic,

    #[error("Packed module has unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("Packed module section directory points outside the buffer")]
    BadSectionDirectory,
}

/// A range insertion collided with an existing entry.
///
/// Used internally while building per-module range indexes; collisions
/// mark the module corrupt rather than failing the load.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("Range is empty")]
    Empty,

    #[error("Range overlaps an existing entry")]
    Overlap,
}

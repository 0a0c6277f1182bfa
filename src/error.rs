//! Every way an allocator call can be refused.
//!
//! A rejected call both returns one of these values and writes a
//! diagnostic through the `log` facade; the allocator's observable
//! state does not change on rejection.  The one exception is
//! `CanaryCorruption`, which is reported while the free still takes
//! effect.
use thiserror::Error;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The requested alignment is not a power of two.
    #[error("alignment must be a power of two")]
    BadAlignment,

    /// The requested size is zero.
    #[error("allocation size must be nonzero")]
    BadSize,

    /// The new block would run into the opposite stack.
    #[error("allocation would overlap the opposite stack")]
    Overlap,

    /// The region cannot supply the backing memory.
    #[error("backing memory exhausted")]
    OutOfMemory,

    /// The freed pointer is null or outside the region.
    #[error("pointer is not inside the allocator's region")]
    BadPointer,

    /// The freed pointer is not the top of its stack.
    #[error("only the most recent allocation on a side may be freed")]
    LifoViolation,

    /// A canary did not hold the expected pattern on free.
    #[error("canary overwritten: something wrote outside its payload")]
    CanaryCorruption,

    /// The backing region could not be acquired at construction.
    #[error("could not acquire the backing region")]
    ConstructionFailed,
}

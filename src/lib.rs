//! Two last-in-first-out allocation stacks over one contiguous
//! region: the front stack grows up from the low address, the back
//! stack down from the high address, and the space between them is
//! whatever neither side has claimed yet.  Every block is bracketed
//! by canary words and carries a hidden header just below its
//! payload, so frees validate their pointer and out-of-bounds writes
//! are detected.  The on-demand variant reserves a large virtual
//! range up front and commits physical pages only as either stack
//! advances.
mod error;
mod layout;
mod map;
mod region;
mod stack;

pub use error::AllocError;
pub use layout::align_down;
pub use layout::align_up;
pub use layout::is_power_of_two;
pub use stack::AllocatorConfig;
pub use stack::DoubleEndedStackAllocator;
pub use stack::GrowthPolicy;
pub use stack::DEFAULT_RESERVATION;

//! # cinder-reclaim
//!
//! Memory reclamation substrate for the cinder containers.
//!
//! - **Ref**: intrusive atomic reference counting whose last decrement defers
//!   destruction instead of freeing
//! - **Deferred stacks**: per-thread stacks of retired allocations, each
//!   stamped with the epoch at which it became unreachable
//! - **Epoch coordinator**: the ordered set of in-flight epoch tokens and the
//!   earliest epoch any of them can still observe
//! - **Collector**: the process-wide coordinator that pins threads and frees
//!   retired allocations once no pin can reach them
//!
//! A retired allocation is freed only when its count is zero and every pin
//! taken before it was retired has been released.

pub mod collector;
pub mod deferred;
pub mod epoch;
pub mod refs;

pub use collector::{collect, collector, defer_free, pending, pin, Collector, Guard};
pub use deferred::{DeferredStack, DestroyFn, Retired};
pub use epoch::{EpochCoordinator, EpochToken};
pub use refs::{Managed, Ref, RefCount};

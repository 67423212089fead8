//! Architecture-specific definitions.
//!
//! The native geometry and entry format are always compiled: the layer manipulates the
//! same bits whether it runs on hardware or on the emulated machine. The emulated machine
//! (memory, MMU with software TLBs, frame allocator) is only built for tests or when the
//! `software-emulation` feature is enabled.

mod native;
pub use native::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

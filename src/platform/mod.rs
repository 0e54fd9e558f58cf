//! Process control primitives
//!
//! The detection program is deployed on Linux hosts only, so this module
//! is Unix-only.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;

#[cfg(not(unix))]
compile_error!("dsctl supports Unix targets only");

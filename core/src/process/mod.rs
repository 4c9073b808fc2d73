//! OS process plumbing for worker children
//!
//! Only Unix is supported: workers rely on process groups for cleanup and on
//! `dup2` for stream redirection.

pub mod unix;

pub use unix::*;

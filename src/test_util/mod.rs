//! Utilities that are useful for testing code built on the recovery layer. They are used
//!  for testing the recovery protocol itself, but they are also exported for application
//!  testing, so they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod node;

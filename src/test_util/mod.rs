//! This module contains utilities that are useful for testing code based on endpoints. They
//!  are used for testing the messaging functionality itself, but they are also exported for
//!  application testing.
//!
//! Test utilities are part of the crate's regular (non-#[cfg(test)]) code so that applications
//!  can use them in their own tests.

pub mod handler;
pub mod node;
pub mod wire;

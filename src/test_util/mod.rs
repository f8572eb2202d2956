//! Utilities for testing code that is built on sessions. They are used for testing the session
//!  layer itself, but they are also exported for application testing.

pub mod transport;

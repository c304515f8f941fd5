//! Device abstraction layer
//!
//! Provides the client interface for networked miners plus a scriptable mock.

mod interface;
mod mock;

pub use interface::*;
pub use mock::{MockDevice, MockResponse};

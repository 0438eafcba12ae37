//! Utilities for testing code built on connections. They are used by this crate's own tests,
//!  and they are part of the regular (non-#[cfg(test)]) code so integration tests and
//!  applications can use them as well.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub mod handler;
pub mod reader;

pub use handler::RecordingHandler;
pub use reader::DocumentReader;

/// convenience method for unit test code: create a localhost address based on a number, the
///  same number generating the same address and different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

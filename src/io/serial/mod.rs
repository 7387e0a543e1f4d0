// src/io/serial/mod.rs
//
// Serial device access for the monitor: enumeration and board detection,
// opening with line parameters, and splitting the byte stream into lines.

mod error;
pub mod framer;
pub mod link;
pub mod ports;
pub(crate) mod utils;

pub use error::SerialError;
pub use framer::LineFramer;
pub use link::{SerialLink, SerialOpener, SystemOpener};
pub use ports::{detect_device, PortEnumerator, SerialPortInfo, SystemPorts};
pub use utils::{LineParams, Parity};

// src/io/serial/link.rs
//
// Opening a device and reading from the open handle. The bridge only sees the
// `SerialOpener` / `SerialLink` traits; `SystemOpener` is the serialport-backed
// implementation used by the server.

use std::io::Read;
use std::time::Duration;

use super::{LineParams, SerialError};

/// An open serial handle owned by the monitor thread.
///
/// `read` blocks for at most the timeout the link was opened with and reports
/// an idle line as `ErrorKind::TimedOut`. `Ok(0)` means the device went away.
pub trait SerialLink: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Release the OS handle
    fn close(self: Box<Self>) -> Result<(), SerialError>;
}

/// Device-open capability
pub trait SerialOpener: Send + Sync {
    fn open(
        &self,
        path: &str,
        params: &LineParams,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// Opens real devices through the serialport crate
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemOpener;

struct SystemLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialOpener for SystemOpener {
    fn open(
        &self,
        path: &str,
        params: &LineParams,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, SerialError> {
        let builder = serialport::new(path, params.baud_rate).timeout(read_timeout);
        let port = params
            .apply(builder)
            .open()
            .map_err(|e| SerialError::OpenFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(SystemLink { port }))
    }
}

impl SerialLink for SystemLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }

    fn close(self: Box<Self>) -> Result<(), SerialError> {
        // Unread input is discarded; the descriptor is released when the port drops
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| SerialError::CloseError(e.to_string()))?;
        drop(self.port);
        Ok(())
    }
}

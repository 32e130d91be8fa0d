use log::{debug, info};
use rusb::{DeviceHandle, GlobalContext};
use std::time::Duration;

use crate::device_ids::UsbId;
use crate::protocol::{Pipe, Transport, TransportError};

/// Transport over a libusb bulk pipe. Holds the device selection and reset
/// policy; an exclusive handle only exists between open and close.
pub struct UsbTransport {
    id: UsbId,
    interface: u8,
    reset: bool,
}

impl UsbTransport {
    pub fn new(id: UsbId, interface: u8, reset: bool) -> Self {
        UsbTransport {
            id,
            interface,
            reset,
        }
    }
}

impl Transport for UsbTransport {
    type Pipe = UsbPipe;

    fn open(&mut self) -> Result<UsbPipe, TransportError> {
        let mut handle = rusb::open_device_with_vid_pid(self.id.vid, self.id.pid)
            .ok_or(TransportError::DeviceNotFound { id: self.id })?;

        if self.reset {
            info!("resetting device {}", self.id);
            handle.reset()?;
        }

        // The kernel's mass-storage driver binds the interface as soon as the
        // device enumerates; it has to let go before we can claim it.
        if handle.kernel_driver_active(self.interface).unwrap_or(false) {
            debug!("detaching kernel driver from interface {}", self.interface);
            handle.detach_kernel_driver(self.interface)?;
        }

        handle.set_active_configuration(1)?;
        handle.claim_interface(self.interface)?;
        info!(
            "device {} opened, interface {} claimed",
            self.id, self.interface
        );

        Ok(UsbPipe {
            handle,
            interface: self.interface,
            claimed: true,
        })
    }
}

/// An open bulk pipe with the unlock interface claimed.
pub struct UsbPipe {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    claimed: bool,
}

impl Pipe for UsbPipe {
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let sent = self.handle.write_bulk(endpoint, data, timeout)?;
        if sent < data.len() {
            return Err(TransportError::ShortTransfer {
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(sent)
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(Into::into)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.claimed {
            self.claimed = false;
            self.handle.release_interface(self.interface)?;
            debug!("interface {} released", self.interface);
        }
        Ok(())
    }
}

// Backstop for paths that never reach the explicit close, e.g. unwinds. The
// handle itself is disposed by rusb when it drops.
impl Drop for UsbPipe {
    fn drop(&mut self) {
        if self.claimed {
            let _ = self.handle.release_interface(self.interface);
        }
    }
}

//! [Channel] implementation over libusb, for a SPMP8000 attached in ISP mode

use std::time::Duration;

use log::{debug, info, warn};
use rusb::{DeviceHandle, GlobalContext};

use super::Channel;
use crate::error::ChannelError;

pub const SPMP8000_VID: u16 = 0x04FC;
pub const SPMP8000_PID: u16 = 0x7201;

const USB_CONFIG: u8 = 1;
const USB_INTERFACE: u8 = 0;
const EP_BULK_OUT: u8 = 0x02;
const EP_BULK_IN: u8 = 0x81;

impl From<rusb::Error> for ChannelError {
    fn from(value: rusb::Error) -> Self {
        match value {
            rusb::Error::Timeout => ChannelError::Timeout,
            rusb::Error::NoDevice => ChannelError::Disconnected,
            other => ChannelError::Usb(other),
        }
    }
}

/// The bulk endpoints of a claimed ISP interface
#[derive(Debug)]
pub struct UsbChannel {
    handle: DeviceHandle<GlobalContext>,
}

impl UsbChannel {
    /// Find the first SPMP8000 in ISP mode, take it away from the mass storage driver, and claim
    /// its vendor interface.
    pub fn open() -> Result<Self, ChannelError> {
        debug!("Looking for SPMP8000 device {SPMP8000_VID:04x}:{SPMP8000_PID:04x}");
        let handle = rusb::open_device_with_vid_pid(SPMP8000_VID, SPMP8000_PID)
            .ok_or(ChannelError::NotFound)?;

        if let Err(e) = handle.reset() {
            warn!("USB reset failed: {e}");
        }

        if handle.kernel_driver_active(USB_INTERFACE).unwrap_or(false) {
            handle.detach_kernel_driver(USB_INTERFACE)?;
            debug!("Detached kernel driver from device");
        }

        handle.set_active_configuration(USB_CONFIG)?;
        handle.claim_interface(USB_INTERFACE)?;

        info!("SPMP8000 device found");
        Ok(Self { handle })
    }
}

impl Channel for UsbChannel {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        Ok(self.handle.write_bulk(EP_BULK_OUT, data, timeout)?)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        Ok(self.handle.read_bulk(EP_BULK_IN, buf, timeout)?)
    }
}

impl Drop for UsbChannel {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(USB_INTERFACE);
    }
}

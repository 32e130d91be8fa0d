use std::fmt::Display;

const SAMSUNG_VID: u16 = 0x04e8;

/// Product ID the drive presents while it is password-locked.
const T3_LOCKED_PID: u16 = 0x61f4;

/// The locked drive's only interface; the vendor commands ride on its bulk pipe.
pub const UNLOCK_INTERFACE: u8 = 0;

/// Bulk-out endpoint the command blocks and password payload are written to.
pub const ENDPOINT_OUT: u8 = 0x02;

/// Bulk-in endpoint the per-phase acknowledgement blocks are read from.
pub const ENDPOINT_IN: u8 = 0x81;

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// ID pair of the only device this tool targets.
pub const T3_LOCKED: UsbId = UsbId {
    vid: SAMSUNG_VID,
    pid: T3_LOCKED_PID,
};

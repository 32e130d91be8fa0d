/// USB IDs, interface number, and endpoint addresses for the supported device.
pub mod device_ids;

/// Build the fixed-layout command blocks and password payload sent during the unlock handshake.
pub mod wire;

/// Run the unlock handshake against a connected device over a bulk USB pipe.
pub mod protocol;

/// rusb-backed transport the handshake runs over on real hardware.
pub mod usb;

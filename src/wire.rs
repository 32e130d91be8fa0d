use byteorder::{LE, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Every command block is exactly this long on the wire.
pub const BLOCK_LEN: usize = 30;

/// The password always travels as a single block of exactly this many bytes.
pub const PAYLOAD_LEN: usize = 512;

// ASCII "USBC" read as a little-endian 32-bit constant; leads every block.
const BLOCK_MAGIC: u32 = 0x4342_5355;

const OPCODE_PASSWORD: u32 = 10;
const OPCODE_RELINK: u32 = 11;

/// Sub-command selector the firmware expects on the first password write.
pub const PHASE_ONE_PARAM: i8 = -42;

/// Sub-command selector the firmware expects on the second password write.
pub const PHASE_TWO_PARAM: i8 = -58;

const RELINK_PARAM: i8 = -24;

// Fixed fields with no meaning at this layer, taken from USB captures of the
// vendor tool. The firmware silently hangs if any of them change, so they are
// carried bit-for-bit.
const PASSWORD_TAG: u32 = 2;
const PASSWORD_FLAG: u8 = 16;
const PASSWORD_CHECK: u16 = 79;
const PASSWORD_SEAL: u8 = 194;
const PASSWORD_TRAIL: u16 = 176;

const RELINK_FLAG: u8 = 6;

/// Ways a block or payload can fail to encode. All of these are caller
/// precondition violations; nothing here touches the device.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    #[error("password is {actual} bytes of UTF-8; at most {limit} fit in the payload block", limit = PAYLOAD_LEN)]
    PasswordTooLong { actual: usize },

    #[error("payload length {actual} is not a multiple of {block} bytes", block = PAYLOAD_LEN)]
    MisalignedPayload { actual: u32 },

    #[error("payload length {actual} overflows the block count field")]
    OversizedPayload { actual: u32 },
}

/// One 30-byte vendor command block. Field names are ours; the values are
/// opaque firmware selectors (see the constants above).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandBlock {
    opcode: u32,
    tag: u32,
    flag: u8,
    parameter: i8,
    block_count: u8,
    check: u16,
    seal: u8,
    trail: u16,
}

impl CommandBlock {
    /// Encode the block into its fixed little-endian wire layout. Byte
    /// offsets 8..14, 20..22, and 28..30 are reserved and stay zero.
    pub fn encode(&self) -> [u8; BLOCK_LEN] {
        let mut block = [0u8; BLOCK_LEN];
        let mut cursor = Cursor::new(&mut block[..]);

        cursor.write_u32::<LE>(BLOCK_MAGIC).unwrap();
        cursor.write_u32::<LE>(self.opcode).unwrap();
        cursor.set_position(14);
        cursor.write_u32::<LE>(self.tag).unwrap();
        cursor.write_u8(self.flag).unwrap();
        cursor.write_i8(self.parameter).unwrap();
        cursor.set_position(22);
        cursor.write_u8(self.block_count).unwrap();
        cursor.write_u16::<LE>(self.check).unwrap();
        cursor.write_u8(self.seal).unwrap();
        cursor.write_u16::<LE>(self.trail).unwrap();
        debug_assert_eq!(cursor.position(), 28);

        block
    }
}

/// Build the header block announcing a password write. `parameter` selects
/// the handshake phase ([PHASE_ONE_PARAM] or [PHASE_TWO_PARAM]); the block
/// count field is derived from `payload_len`, which must be a multiple of
/// the 512-byte payload block size.
pub fn password_header(parameter: i8, payload_len: u32) -> Result<CommandBlock, WireError> {
    if payload_len % PAYLOAD_LEN as u32 != 0 {
        return Err(WireError::MisalignedPayload {
            actual: payload_len,
        });
    }

    let block_count = u8::try_from(payload_len / PAYLOAD_LEN as u32)
        .map_err(|_| WireError::OversizedPayload {
            actual: payload_len,
        })?;

    Ok(CommandBlock {
        opcode: OPCODE_PASSWORD,
        tag: PASSWORD_TAG,
        flag: PASSWORD_FLAG,
        parameter,
        block_count,
        check: PASSWORD_CHECK,
        seal: PASSWORD_SEAL,
        trail: PASSWORD_TRAIL,
    })
}

/// Build the relink command that makes the device drop off the bus and
/// re-enumerate unlocked. Everything past the phase parameter is zero.
pub fn relink_command() -> CommandBlock {
    CommandBlock {
        opcode: OPCODE_RELINK,
        tag: 0,
        flag: RELINK_FLAG,
        parameter: RELINK_PARAM,
        block_count: 0,
        check: 0,
        seal: 0,
        trail: 0,
    }
}

/// Encode `password` as UTF-8, left-justified into a 512-byte buffer and
/// zero-padded. A password that does not fit is an error, never a truncation:
/// a truncated password would be a *different* password and the device would
/// reject it with no indication of why.
pub fn password_payload(password: &str) -> Result<[u8; PAYLOAD_LEN], WireError> {
    let bytes = password.as_bytes();
    if bytes.len() > PAYLOAD_LEN {
        return Err(WireError::PasswordTooLong {
            actual: bytes.len(),
        });
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..bytes.len()].copy_from_slice(bytes);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference encoding of the phase-one password header for a 512-byte
    // payload, byte for byte.
    const PHASE_ONE_HEADER: [u8; BLOCK_LEN] = [
        0x55, 0x53, 0x42, 0x43, // "USBC"
        0x0a, 0x00, 0x00, 0x00, // opcode 10
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
        0x02, 0x00, 0x00, 0x00, // tag
        0x10, // flag
        0xd6, // parameter -42
        0x00, 0x00, // reserved
        0x01, // block count (512 / 512)
        0x4f, 0x00, // check
        0xc2, // seal
        0xb0, 0x00, // trail
        0x00, 0x00, // reserved
    ];

    const RELINK: [u8; BLOCK_LEN] = [
        0x55, 0x53, 0x42, 0x43, // "USBC"
        0x0b, 0x00, 0x00, 0x00, // opcode 11
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
        0x00, 0x00, 0x00, 0x00, // tag
        0x06, // flag
        0xe8, // parameter -24
        0x00, 0x00, // reserved
        0x00, // block count
        0x00, 0x00, // check
        0x00, // seal
        0x00, 0x00, // trail
        0x00, 0x00, // reserved
    ];

    #[test]
    fn password_header_matches_reference_bytes() {
        let block = password_header(PHASE_ONE_PARAM, 512).unwrap();
        assert_eq!(block.encode(), PHASE_ONE_HEADER);
    }

    #[test]
    fn relink_command_matches_reference_bytes() {
        assert_eq!(relink_command().encode(), RELINK);
    }

    #[test]
    fn all_blocks_share_the_magic() {
        let header = password_header(PHASE_TWO_PARAM, 512).unwrap().encode();
        let relink = relink_command().encode();
        assert_eq!(&header[..4], b"USBC");
        assert_eq!(&relink[..4], b"USBC");
    }

    #[test]
    fn phase_headers_differ_only_in_the_parameter() {
        let one = password_header(PHASE_ONE_PARAM, 512).unwrap().encode();
        let two = password_header(PHASE_TWO_PARAM, 512).unwrap().encode();

        let diff: Vec<usize> = (0..BLOCK_LEN).filter(|&i| one[i] != two[i]).collect();
        assert_eq!(diff, vec![19]);
        assert_eq!(two[19], PHASE_TWO_PARAM as u8);
    }

    #[test]
    fn builders_are_deterministic() {
        assert_eq!(
            password_header(PHASE_ONE_PARAM, 512).unwrap().encode(),
            password_header(PHASE_ONE_PARAM, 512).unwrap().encode(),
        );
        assert_eq!(relink_command().encode(), relink_command().encode());
    }

    #[test]
    fn password_header_rejects_misaligned_payload() {
        assert_eq!(
            password_header(PHASE_ONE_PARAM, 513),
            Err(WireError::MisalignedPayload { actual: 513 }),
        );
    }

    #[test]
    fn password_header_rejects_oversized_payload() {
        let too_big = 512 * 256;
        assert_eq!(
            password_header(PHASE_ONE_PARAM, too_big),
            Err(WireError::OversizedPayload { actual: too_big }),
        );
    }

    #[test]
    fn payload_is_zero_padded_to_fixed_length() {
        let payload = password_payload("hunter2").unwrap();
        assert_eq!(payload.len(), PAYLOAD_LEN);
        assert_eq!(&payload[..7], b"hunter2");
        assert!(payload[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn payload_keeps_multibyte_utf8_intact() {
        let payload = password_payload("pässword").unwrap();
        assert_eq!(&payload[..9], "pässword".as_bytes());
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn payload_accepts_an_exact_fit() {
        let password = "a".repeat(PAYLOAD_LEN);
        let payload = password_payload(&password).unwrap();
        assert!(payload.iter().all(|&b| b == b'a'));
    }

    #[test]
    fn payload_rejects_a_password_that_does_not_fit() {
        let password = "a".repeat(PAYLOAD_LEN + 1);
        assert_eq!(
            password_payload(&password),
            Err(WireError::PasswordTooLong {
                actual: PAYLOAD_LEN + 1
            }),
        );
    }

    #[test]
    fn multibyte_utf8_counts_encoded_bytes_not_chars() {
        // 256 two-byte chars encode to 512 bytes and fit; 257 do not.
        assert!(password_payload(&"ä".repeat(256)).is_ok());
        assert_eq!(
            password_payload(&"ä".repeat(257)),
            Err(WireError::PasswordTooLong { actual: 514 }),
        );
    }
}

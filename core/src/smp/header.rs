/// SMP frame header codec
///
/// Every SMP message starts with a fixed 8-byte header:
/// `[op | flags | length (BE u16) | group (BE u16) | sequence | command]`.
/// Over BLE the header only appears on the first chunk of a message, so
/// `parse` treats short input as "no header" instead of an error.

use serde::{Deserialize, Serialize};

/// Size of the SMP header in bytes
pub const HEADER_LENGTH: usize = 8;

const OP_MASK: u8 = 0b0000_0111;
const VERSION_SHIFT: u8 = 3;
const VERSION_MASK: u8 = 0b0001_1000;
const RESERVED_SHIFT: u8 = 5;

/// SMP operation carried in the low three bits of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McuMgrOperation {
    Read,
    ReadResponse,
    Write,
    WriteResponse,
    /// Reserved operation value (4..=7)
    Reserved(u8),
}

impl McuMgrOperation {
    /// Whether this operation is sent by the device in reply to a request
    pub fn is_response(&self) -> bool {
        matches!(self, Self::ReadResponse | Self::WriteResponse)
    }

    /// The operation a device answers this request with
    pub fn response(&self) -> Option<Self> {
        match self {
            Self::Read => Some(Self::ReadResponse),
            Self::Write => Some(Self::WriteResponse),
            _ => None,
        }
    }
}

impl From<u8> for McuMgrOperation {
    fn from(value: u8) -> Self {
        match value & OP_MASK {
            0 => Self::Read,
            1 => Self::ReadResponse,
            2 => Self::Write,
            3 => Self::WriteResponse,
            other => Self::Reserved(other),
        }
    }
}

impl From<McuMgrOperation> for u8 {
    fn from(op: McuMgrOperation) -> Self {
        match op {
            McuMgrOperation::Read => 0,
            McuMgrOperation::ReadResponse => 1,
            McuMgrOperation::Write => 2,
            McuMgrOperation::WriteResponse => 3,
            McuMgrOperation::Reserved(value) => value & OP_MASK,
        }
    }
}

/// Decoded SMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McuMgrHeader {
    pub op: McuMgrOperation,
    /// SMP protocol version (0 = v1, 1 = v2)
    pub version: u8,
    /// Top three bits of the first byte, unused by the protocol but kept so
    /// a header re-encodes to the bytes it was read from
    pub reserved: u8,
    pub flags: u8,
    /// Payload length, excluding the header
    pub length: u16,
    pub group: u16,
    pub sequence_number: u8,
    pub command_id: u8,
}

impl McuMgrHeader {
    /// Build a request header
    pub fn new(op: McuMgrOperation, group: u16, sequence_number: u8, command_id: u8, length: u16) -> Self {
        Self {
            op,
            version: 0,
            reserved: 0,
            flags: 0,
            length,
            group,
            sequence_number,
            command_id,
        }
    }

    /// Decode a header from the start of `bytes`.
    ///
    /// Returns `None` when fewer than [`HEADER_LENGTH`] bytes are available.
    /// Any 8 bytes decode to some header; validating the values is left to
    /// the caller.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_LENGTH] = bytes.get(..HEADER_LENGTH)?.try_into().ok()?;
        Some(Self {
            op: McuMgrOperation::from(bytes[0]),
            version: (bytes[0] & VERSION_MASK) >> VERSION_SHIFT,
            reserved: bytes[0] >> RESERVED_SHIFT,
            flags: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            group: u16::from_be_bytes([bytes[4], bytes[5]]),
            sequence_number: bytes[6],
            command_id: bytes[7],
        })
    }

    /// Encode the header alone
    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let length = self.length.to_be_bytes();
        let group = self.group.to_be_bytes();
        [
            u8::from(self.op)
                | ((self.version << VERSION_SHIFT) & VERSION_MASK)
                | (self.reserved << RESERVED_SHIFT),
            self.flags,
            length[0],
            length[1],
            group[0],
            group[1],
            self.sequence_number,
            self.command_id,
        ]
    }

    /// Encode a complete frame: header followed by `payload`.
    ///
    /// The header's `length` is taken from the payload.
    pub fn serialize(&self, payload: &[u8]) -> Result<Vec<u8>, FrameTooLarge> {
        let length = u16::try_from(payload.len()).map_err(|_| FrameTooLarge(payload.len()))?;
        let header = Self { length, ..*self };
        let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Total frame size this header announces
    pub fn frame_length(&self) -> usize {
        HEADER_LENGTH + self.length as usize
    }
}

/// Payload does not fit the 16-bit length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Payload of {0} bytes exceeds the SMP length field")]
pub struct FrameTooLarge(pub usize);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_known_frame() {
        let bytes = [0x01, 0x00, 0x00, 0x0A, 0x00, 0x04, 0x2A, 0x05, 0xBF];
        let header = McuMgrHeader::parse(&bytes).expect("header");

        assert_eq!(header.op, McuMgrOperation::ReadResponse);
        assert_eq!(header.version, 0);
        assert_eq!(header.length, 10);
        assert_eq!(header.group, 4);
        assert_eq!(header.sequence_number, 0x2A);
        assert_eq!(header.command_id, 5);
        assert_eq!(header.frame_length(), 18);
    }

    #[test]
    fn test_parse_short_input_is_none() {
        assert!(McuMgrHeader::parse(&[]).is_none());
        assert!(McuMgrHeader::parse(&[0u8; HEADER_LENGTH - 1]).is_none());
    }

    #[test]
    fn test_version_bits() {
        let header = McuMgrHeader::parse(&[0x0A, 0, 0, 0, 0, 0, 0, 0]).expect("header");
        assert_eq!(header.op, McuMgrOperation::Write);
        assert_eq!(header.version, 1);
        assert_eq!(header.to_bytes()[0], 0x0A);
    }

    #[test]
    fn test_reserved_bits_survive_reencoding() {
        let bytes = [0xE1, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01, 0x05];
        let header = McuMgrHeader::parse(&bytes).expect("header");

        assert_eq!(header.op, McuMgrOperation::ReadResponse);
        assert_eq!(header.version, 0);
        assert_eq!(header.reserved, 0b111);
        assert_eq!(header.to_bytes(), bytes);
    }

    #[test]
    fn test_serialize_sets_length() {
        let header = McuMgrHeader::new(McuMgrOperation::Write, 4, 7, 1, 0);
        let frame = header.serialize(&[0xAA; 300]).expect("frame");

        assert_eq!(frame.len(), HEADER_LENGTH + 300);
        assert_eq!(&frame[2..4], &300u16.to_be_bytes());
        assert_eq!(McuMgrHeader::parse(&frame).expect("header").length, 300);
    }

    #[test]
    fn test_serialize_rejects_oversized_payload() {
        let header = McuMgrHeader::new(McuMgrOperation::Write, 1, 0, 1, 0);
        let result = header.serialize(&vec![0u8; u16::MAX as usize + 1]);
        assert_eq!(result, Err(FrameTooLarge(u16::MAX as usize + 1)));
    }

    #[test]
    fn test_response_ops() {
        assert_eq!(McuMgrOperation::Read.response(), Some(McuMgrOperation::ReadResponse));
        assert_eq!(McuMgrOperation::Write.response(), Some(McuMgrOperation::WriteResponse));
        assert!(McuMgrOperation::WriteResponse.is_response());
        assert!(!McuMgrOperation::Reserved(5).is_response());
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            first in any::<u8>(),
            flags in any::<u8>(),
            length in any::<u16>(),
            group in any::<u16>(),
            sequence in any::<u8>(),
            command in any::<u8>(),
        ) {
            let mut bytes = vec![first, flags];
            bytes.extend_from_slice(&length.to_be_bytes());
            bytes.extend_from_slice(&group.to_be_bytes());
            bytes.push(sequence);
            bytes.push(command);

            let header = McuMgrHeader::parse(&bytes).expect("8 bytes always parse");
            prop_assert_eq!(header.to_bytes().to_vec(), bytes);
        }

        #[test]
        fn prop_short_input_never_parses(bytes in proptest::collection::vec(any::<u8>(), 0..HEADER_LENGTH)) {
            prop_assert!(McuMgrHeader::parse(&bytes).is_none());
        }
    }
}

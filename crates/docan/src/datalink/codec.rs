//! Bit-exact encoding and decoding of ISO 15765-2 frames.

/// Longest message length encodable in the short first frame form.
const MAX_SHORT_FIRST_FRAME_LENGTH: usize = 0xfff;

/// Header bytes of the escape form first frame: PCI byte, zero length
/// byte, 32 bit big endian message length.
const ESCAPE_FIRST_FRAME_HEADER: usize = 6;

/// Filler byte used where a frame has to be longer than its content.
const DEFAULT_FILLER: u8 = 0xcc;

/// Frame lengths transportable by CAN FD above the classic 8 bytes.
const FD_FRAME_LENGTHS: [u8; 7] = [12, 16, 20, 24, 32, 48, 64];

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// Status field of a flow control frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStatus {
    /// Continue to send.
    Cts,
    /// Wait for another flow control frame.
    Wait,
    /// Receiver side buffer overflow, abort the transfer.
    Overflow,
    /// Reserved value seen on the wire.
    Invalid,
}

impl FlowStatus {
    pub fn from_wire(nibble: u8) -> Self {
        match nibble {
            0 => FlowStatus::Cts,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            _ => FlowStatus::Invalid,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            FlowStatus::Cts => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
            FlowStatus::Invalid => 0xf,
        }
    }
}

/// A decoded frame borrowing its payload from the input buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'f> {
    Single {
        payload: &'f [u8],
    },
    First {
        total_length: u32,
        payload: &'f [u8],
    },
    Consecutive {
        sequence_number: u8,
        payload: &'f [u8],
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        encoded_min_separation_time: u8,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer is too short for the frame.
    ShortBuffer,
    /// The PCI type nibble is not a known frame type.
    UnknownFrameType,
    /// The payload size is not encodable in the requested frame type.
    InvalidPayloadSize,
    /// A decoded length field is inconsistent with the frame size.
    InvalidLength,
    /// An escape form length that would have fit a plain single frame.
    InvalidEscapeLength,
    /// The message needs more frames than a frame index can address.
    MessageTooLarge,
}

/// Static configuration of a frame codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCodecConfig {
    /// Largest frame payload the data link transports (8 for classic
    /// CAN, up to 64 for CAN FD).
    pub max_frame_size: u8,
    /// Padding byte for filling frames up to their transport length, or
    /// `None` to emit frames of minimal length.
    pub padding: Option<u8>,
}

impl FrameCodecConfig {
    pub const OPTIMIZED_CLASSIC: Self = Self {
        max_frame_size: 8,
        padding: None,
    };
    pub const PADDED_CLASSIC: Self = Self {
        max_frame_size: 8,
        padding: Some(DEFAULT_FILLER),
    };
    pub const OPTIMIZED_FD: Self = Self {
        max_frame_size: 64,
        padding: None,
    };
    pub const PADDED_FD: Self = Self {
        max_frame_size: 64,
        padding: Some(DEFAULT_FILLER),
    };
}

/// Codec for one data link payload configuration.
///
/// Frame layout (classic 8 byte CAN):
///
/// ```text
/// Single       | 0x0 len  | payload (1..=7)
/// First        | 0x1 l11:8| l7:0 | payload (6)
/// First escape | 0x1 0x0  | 0x00 | len as u32 BE | payload (2)
/// Consecutive  | 0x2 seq  | payload (1..=7)
/// Flow control | 0x3 stat | block size | st_min
/// ```
///
/// With CAN FD frame sizes the same layouts apply; additionally a single
/// frame longer than 7 bytes uses an escape header (`0x00`, length byte)
/// and encoded frames are filled up to the next length the data link can
/// transport.
pub struct FrameCodec {
    config: FrameCodecConfig,
}

impl FrameCodec {
    pub const fn new(config: FrameCodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameCodecConfig {
        &self.config
    }

    fn max_frame_size(&self) -> usize {
        self.config.max_frame_size as usize
    }

    fn is_fd(&self) -> bool {
        self.max_frame_size() > 8
    }

    /// Largest payload a single frame can carry.
    pub fn single_frame_capacity(&self) -> usize {
        if self.is_fd() {
            self.max_frame_size() - 2
        } else {
            self.max_frame_size() - 1
        }
    }

    /// Payload bytes per consecutive frame.
    pub fn consecutive_frame_data_size(&self) -> usize {
        self.max_frame_size() - 1
    }

    /// Payload bytes the first frame carries for a message of
    /// `total_length` (smaller in the escape encoding).
    pub fn first_frame_data_size(&self, total_length: usize) -> usize {
        if total_length <= MAX_SHORT_FIRST_FRAME_LENGTH {
            self.max_frame_size() - 2
        } else {
            self.max_frame_size() - ESCAPE_FIRST_FRAME_HEADER
        }
    }

    /// Maps a message length to the number of frames needed and the
    /// consecutive frame data size of the chosen encoding.
    pub fn encoded_frame_count(&self, payload_length: usize) -> Result<(u16, u8), CodecError> {
        if payload_length == 0 {
            return Err(CodecError::InvalidPayloadSize);
        }
        if payload_length > u32::MAX as usize {
            return Err(CodecError::MessageTooLarge);
        }
        if payload_length <= self.single_frame_capacity() {
            return Ok((1, 0));
        }
        let consecutive_size = self.consecutive_frame_data_size();
        let first_size = self.first_frame_data_size(payload_length);
        let frame_count = 1 + (payload_length - first_size).div_ceil(consecutive_size);
        if frame_count > usize::from(u16::MAX) {
            return Err(CodecError::MessageTooLarge);
        }
        Ok((frame_count as u16, consecutive_size as u8))
    }

    /// Length the encoded frame occupies on the wire, including padding
    /// and the CAN FD length quantization.
    fn frame_length(&self, needed: usize) -> usize {
        if self.is_fd() {
            if self.config.padding.is_some() || needed > 8 {
                if needed <= 8 {
                    8
                } else {
                    usize::from(
                        *FD_FRAME_LENGTHS
                            .iter()
                            .find(|&&length| usize::from(length) >= needed)
                            .unwrap_or(&self.config.max_frame_size),
                    )
                }
            } else {
                needed
            }
        } else if self.config.padding.is_some() {
            self.max_frame_size()
        } else {
            needed
        }
    }

    fn finish_frame(&self, buffer: &mut [u8], needed: usize) -> Result<usize, CodecError> {
        let length = self.frame_length(needed);
        if buffer.len() < length {
            return Err(CodecError::ShortBuffer);
        }
        let filler = self.config.padding.unwrap_or(DEFAULT_FILLER);
        buffer[needed..length].fill(filler);
        Ok(length)
    }

    /// Encodes a single frame carrying the complete `payload`.
    pub fn encode_single_frame(
        &self,
        payload: &[u8],
        buffer: &mut [u8],
    ) -> Result<usize, CodecError> {
        if payload.is_empty() || payload.len() > self.single_frame_capacity() {
            return Err(CodecError::InvalidPayloadSize);
        }
        if buffer.len() < 2 {
            return Err(CodecError::ShortBuffer);
        }
        let needed = if payload.len() <= 7 {
            buffer[0] = (PCI_SINGLE << 4) | payload.len() as u8;
            let needed = 1 + payload.len();
            if buffer.len() < needed {
                return Err(CodecError::ShortBuffer);
            }
            buffer[1..needed].copy_from_slice(payload);
            needed
        } else {
            // CAN FD escape form: zero length nibble, length in byte 1.
            buffer[0] = PCI_SINGLE << 4;
            buffer[1] = payload.len() as u8;
            let needed = 2 + payload.len();
            if buffer.len() < needed {
                return Err(CodecError::ShortBuffer);
            }
            buffer[2..needed].copy_from_slice(payload);
            needed
        };
        self.finish_frame(buffer, needed)
    }

    /// Encodes the first frame of a segmented message. `payload` must be
    /// exactly the initial chunk the chosen encoding transports.
    pub fn encode_first_frame(
        &self,
        total_length: usize,
        payload: &[u8],
        buffer: &mut [u8],
    ) -> Result<usize, CodecError> {
        if total_length <= self.single_frame_capacity() || total_length > u32::MAX as usize {
            return Err(CodecError::InvalidPayloadSize);
        }
        if payload.len() != self.first_frame_data_size(total_length) {
            return Err(CodecError::InvalidPayloadSize);
        }
        if buffer.len() < self.max_frame_size() {
            return Err(CodecError::ShortBuffer);
        }
        let needed = if total_length <= MAX_SHORT_FIRST_FRAME_LENGTH {
            buffer[0] = (PCI_FIRST << 4) | ((total_length >> 8) as u8 & 0xf);
            buffer[1] = total_length as u8;
            buffer[2..2 + payload.len()].copy_from_slice(payload);
            2 + payload.len()
        } else {
            buffer[0] = PCI_FIRST << 4;
            buffer[1] = 0x00;
            buffer[2..6].copy_from_slice(&(total_length as u32).to_be_bytes());
            buffer[6..6 + payload.len()].copy_from_slice(payload);
            ESCAPE_FIRST_FRAME_HEADER + payload.len()
        };
        self.finish_frame(buffer, needed)
    }

    /// Encodes a consecutive frame with the given sequence number.
    pub fn encode_consecutive_frame(
        &self,
        sequence_number: u8,
        payload: &[u8],
        buffer: &mut [u8],
    ) -> Result<usize, CodecError> {
        if payload.is_empty() || payload.len() > self.consecutive_frame_data_size() {
            return Err(CodecError::InvalidPayloadSize);
        }
        let needed = 1 + payload.len();
        if buffer.len() < needed {
            return Err(CodecError::ShortBuffer);
        }
        buffer[0] = (PCI_CONSECUTIVE << 4) | (sequence_number & 0xf);
        buffer[1..needed].copy_from_slice(payload);
        self.finish_frame(buffer, needed)
    }

    /// Encodes a flow control frame.
    pub fn encode_flow_control_frame(
        &self,
        status: FlowStatus,
        block_size: u8,
        encoded_min_separation_time: u8,
        buffer: &mut [u8],
    ) -> Result<usize, CodecError> {
        if buffer.len() < 3 {
            return Err(CodecError::ShortBuffer);
        }
        buffer[0] = (PCI_FLOW_CONTROL << 4) | status.to_wire();
        buffer[1] = block_size;
        buffer[2] = encoded_min_separation_time;
        self.finish_frame(buffer, 3)
    }

    /// Decodes one frame from a received data link payload.
    pub fn decode_frame<'f>(&self, data: &'f [u8]) -> Result<Frame<'f>, CodecError> {
        if data.is_empty() {
            return Err(CodecError::ShortBuffer);
        }
        let low_nibble = data[0] & 0xf;
        match data[0] >> 4 {
            PCI_SINGLE => {
                if low_nibble == 0 {
                    // Escape form, only meaningful on an FD sized link.
                    if !self.is_fd() || data.len() < 2 {
                        return Err(CodecError::InvalidLength);
                    }
                    let length = usize::from(data[1]);
                    if length <= 7
                        || length > self.single_frame_capacity()
                        || data.len() < 2 + length
                    {
                        return Err(CodecError::InvalidLength);
                    }
                    Ok(Frame::Single {
                        payload: &data[2..2 + length],
                    })
                } else {
                    let length = usize::from(low_nibble);
                    if length > self.single_frame_capacity() || data.len() < 1 + length {
                        return Err(CodecError::InvalidLength);
                    }
                    Ok(Frame::Single {
                        payload: &data[1..1 + length],
                    })
                }
            }
            PCI_FIRST => {
                if data.len() < 3 {
                    return Err(CodecError::ShortBuffer);
                }
                let short_length = (usize::from(low_nibble) << 8) | usize::from(data[1]);
                if short_length == 0 {
                    // Escape form with a 32 bit length field.
                    if data.len() <= ESCAPE_FIRST_FRAME_HEADER {
                        return Err(CodecError::ShortBuffer);
                    }
                    let total_length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
                    if total_length <= ESCAPE_FIRST_FRAME_HEADER as u32 {
                        return Err(CodecError::InvalidEscapeLength);
                    }
                    let payload = &data[ESCAPE_FIRST_FRAME_HEADER..];
                    if payload.len() as u32 >= total_length {
                        return Err(CodecError::InvalidLength);
                    }
                    Ok(Frame::First {
                        total_length,
                        payload,
                    })
                } else {
                    let payload = &data[2..];
                    // A first frame whose message would fit the frame
                    // itself is not a valid encoding.
                    if short_length <= payload.len() {
                        return Err(CodecError::InvalidLength);
                    }
                    Ok(Frame::First {
                        total_length: short_length as u32,
                        payload,
                    })
                }
            }
            PCI_CONSECUTIVE => {
                if data.len() < 2 {
                    return Err(CodecError::ShortBuffer);
                }
                Ok(Frame::Consecutive {
                    sequence_number: low_nibble,
                    payload: &data[1..],
                })
            }
            PCI_FLOW_CONTROL => {
                if data.len() < 3 {
                    return Err(CodecError::ShortBuffer);
                }
                Ok(Frame::FlowControl {
                    status: FlowStatus::from_wire(low_nibble),
                    block_size: data[1],
                    encoded_min_separation_time: data[2],
                })
            }
            _ => Err(CodecError::UnknownFrameType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSIC: FrameCodec = FrameCodec::new(FrameCodecConfig::OPTIMIZED_CLASSIC);
    const PADDED: FrameCodec = FrameCodec::new(FrameCodecConfig::PADDED_CLASSIC);
    const FD: FrameCodec = FrameCodec::new(FrameCodecConfig::OPTIMIZED_FD);

    #[test]
    fn test_frame_count_single_frame_messages() {
        assert_eq!(CLASSIC.encoded_frame_count(1), Ok((1, 0)));
        assert_eq!(CLASSIC.encoded_frame_count(7), Ok((1, 0)));
        assert_eq!(FD.encoded_frame_count(62), Ok((1, 0)));
    }

    #[test]
    fn test_frame_count_segmented_messages() {
        assert_eq!(CLASSIC.encoded_frame_count(8), Ok((2, 7)));
        assert_eq!(CLASSIC.encoded_frame_count(13), Ok((2, 7)));
        assert_eq!(CLASSIC.encoded_frame_count(14), Ok((3, 7)));
        assert_eq!(CLASSIC.encoded_frame_count(15), Ok((3, 7)));
        assert_eq!(CLASSIC.encoded_frame_count(4095), Ok((586, 7)));
        assert_eq!(FD.encoded_frame_count(63), Ok((2, 63)));
    }

    #[test]
    fn test_frame_count_escape_encoding() {
        // 4096 bytes no longer fit the 12 bit length; the first frame
        // then carries only 2 payload bytes on a classic link.
        assert_eq!(CLASSIC.encoded_frame_count(4096), Ok((586, 7)));
        assert_eq!(CLASSIC.encoded_frame_count(4095 * 2 - 1), Ok((1171, 7)));
    }

    #[test]
    fn test_frame_count_limits() {
        assert_eq!(
            CLASSIC.encoded_frame_count(0),
            Err(CodecError::InvalidPayloadSize)
        );
        assert_eq!(
            CLASSIC.encoded_frame_count(1_000_000),
            Err(CodecError::MessageTooLarge)
        );
    }

    #[test]
    fn test_frame_count_matches_encoded_sizes() {
        // The reported distribution must add up to the message length.
        for length in [8usize, 15, 100, 4095, 5000] {
            let (count, consecutive_size) = CLASSIC.encoded_frame_count(length).unwrap();
            let first = CLASSIC.first_frame_data_size(length);
            let rest = length - first;
            let full = rest / usize::from(consecutive_size);
            let tail = rest % usize::from(consecutive_size);
            assert_eq!(
                usize::from(count),
                1 + full + usize::from(tail != 0),
                "length {}",
                length
            );
        }
    }

    #[test]
    fn test_encode_single_frame() {
        let mut buffer = [0u8; 8];
        let length = CLASSIC
            .encode_single_frame(&[0xab, 0xcd, 0xef, 0x19, 0x28], &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..length], &[0x05, 0xab, 0xcd, 0xef, 0x19, 0x28]);
    }

    #[test]
    fn test_encode_single_frame_padded() {
        let mut buffer = [0u8; 8];
        let length = PADDED.encode_single_frame(&[0x11, 0x22], &mut buffer).unwrap();
        assert_eq!(length, 8);
        assert_eq!(
            &buffer[..],
            &[0x02, 0x11, 0x22, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc]
        );
    }

    #[test]
    fn test_encode_single_frame_fd_escape() {
        let payload = [0x55u8; 12];
        let mut buffer = [0u8; 64];
        let length = FD.encode_single_frame(&payload, &mut buffer).unwrap();
        // 2 header + 12 payload, quantized up to the next FD length.
        assert_eq!(length, 16);
        assert_eq!(buffer[0], 0x00);
        assert_eq!(buffer[1], 12);
        assert_eq!(&buffer[2..14], &payload);
        assert_eq!(&buffer[14..16], &[0xcc, 0xcc]);
    }

    #[test]
    fn test_encode_first_frame() {
        let mut buffer = [0u8; 8];
        let length = CLASSIC
            .encode_first_frame(15, &[0xab, 0xcd, 0xef, 0x19, 0x28, 0x98], &mut buffer)
            .unwrap();
        assert_eq!(
            &buffer[..length],
            &[0x10, 0x0f, 0xab, 0xcd, 0xef, 0x19, 0x28, 0x98]
        );
    }

    #[test]
    fn test_encode_first_frame_escape() {
        let mut buffer = [0u8; 8];
        let length = CLASSIC
            .encode_first_frame(0x12345, &[0xab, 0xcd], &mut buffer)
            .unwrap();
        assert_eq!(
            &buffer[..length],
            &[0x10, 0x00, 0x00, 0x01, 0x23, 0x45, 0xab, 0xcd]
        );
    }

    #[test]
    fn test_encode_consecutive_frames() {
        let mut buffer = [0u8; 8];
        let length = CLASSIC
            .encode_consecutive_frame(1, &[0xa1, 0x45, 0x11, 0x22, 0x33, 0x44, 0x55], &mut buffer)
            .unwrap();
        assert_eq!(
            &buffer[..length],
            &[0x21, 0xa1, 0x45, 0x11, 0x22, 0x33, 0x44, 0x55]
        );
        let length = CLASSIC
            .encode_consecutive_frame(2, &[0x67, 0x9e], &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..length], &[0x22, 0x67, 0x9e]);
    }

    #[test]
    fn test_sequence_number_wraps_within_nibble() {
        let mut buffer = [0u8; 8];
        let length = CLASSIC
            .encode_consecutive_frame(0x10, &[0x01], &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..length], &[0x20, 0x01]);
    }

    #[test]
    fn test_encode_flow_control_frames() {
        let mut buffer = [0u8; 8];
        let length = CLASSIC
            .encode_flow_control_frame(FlowStatus::Cts, 0, 0, &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..length], &[0x30, 0x00, 0x00]);
        let length = CLASSIC
            .encode_flow_control_frame(FlowStatus::Wait, 4, 0xf3, &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..length], &[0x31, 0x04, 0xf3]);
        let length = CLASSIC
            .encode_flow_control_frame(FlowStatus::Overflow, 0, 0, &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..length], &[0x32, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_single_frame() {
        let frame = CLASSIC
            .decode_frame(&[0x05, 0xab, 0xcd, 0xef, 0x19, 0x28])
            .unwrap();
        assert_eq!(
            frame,
            Frame::Single {
                payload: &[0xab, 0xcd, 0xef, 0x19, 0x28]
            }
        );
    }

    #[test]
    fn test_decode_single_frame_ignores_padding() {
        let frame = CLASSIC
            .decode_frame(&[0x02, 0x11, 0x22, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc])
            .unwrap();
        assert_eq!(
            frame,
            Frame::Single {
                payload: &[0x11, 0x22]
            }
        );
    }

    #[test]
    fn test_decode_first_frame() {
        let frame = CLASSIC
            .decode_frame(&[0x10, 0x0f, 0xab, 0xcd, 0xef, 0x19, 0x28, 0x98])
            .unwrap();
        assert_eq!(
            frame,
            Frame::First {
                total_length: 15,
                payload: &[0xab, 0xcd, 0xef, 0x19, 0x28, 0x98]
            }
        );
    }

    #[test]
    fn test_decode_first_frame_escape() {
        let frame = CLASSIC
            .decode_frame(&[0x10, 0x00, 0x00, 0x01, 0x23, 0x45, 0xab, 0xcd])
            .unwrap();
        assert_eq!(
            frame,
            Frame::First {
                total_length: 0x12345,
                payload: &[0xab, 0xcd]
            }
        );
    }

    #[test]
    fn test_decode_escape_length_too_small() {
        assert_eq!(
            CLASSIC.decode_frame(&[0x10, 0x00, 0x00, 0x00, 0x00, 0x06, 0xab, 0xcd]),
            Err(CodecError::InvalidEscapeLength)
        );
    }

    #[test]
    fn test_decode_consecutive_frame() {
        let frame = CLASSIC.decode_frame(&[0x2a, 0x67, 0x9e]).unwrap();
        assert_eq!(
            frame,
            Frame::Consecutive {
                sequence_number: 0xa,
                payload: &[0x67, 0x9e]
            }
        );
    }

    #[test]
    fn test_decode_flow_control_frames() {
        assert_eq!(
            CLASSIC.decode_frame(&[0x30, 0x08, 0x02]).unwrap(),
            Frame::FlowControl {
                status: FlowStatus::Cts,
                block_size: 8,
                encoded_min_separation_time: 0x02
            }
        );
        assert_eq!(
            CLASSIC.decode_frame(&[0x31, 0x00, 0x00]).unwrap(),
            Frame::FlowControl {
                status: FlowStatus::Wait,
                block_size: 0,
                encoded_min_separation_time: 0
            }
        );
        // A reserved status nibble decodes as Invalid and is left to the
        // protocol layer to reject.
        assert_eq!(
            CLASSIC.decode_frame(&[0x37, 0x00, 0x00]).unwrap(),
            Frame::FlowControl {
                status: FlowStatus::Invalid,
                block_size: 0,
                encoded_min_separation_time: 0
            }
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(CLASSIC.decode_frame(&[]), Err(CodecError::ShortBuffer));
        assert_eq!(
            CLASSIC.decode_frame(&[0x40, 0x00]),
            Err(CodecError::UnknownFrameType)
        );
        assert_eq!(
            CLASSIC.decode_frame(&[0xf0]),
            Err(CodecError::UnknownFrameType)
        );
        // Single frame length exceeding the frame.
        assert_eq!(
            CLASSIC.decode_frame(&[0x07, 0x01, 0x02]),
            Err(CodecError::InvalidLength)
        );
        // Single frame length exceeding the link capacity.
        assert_eq!(
            CLASSIC.decode_frame(&[0x08, 0, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::InvalidLength)
        );
        // Escape single frame on a classic link.
        assert_eq!(
            CLASSIC.decode_frame(&[0x00, 0x09, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::InvalidLength)
        );
        // First frame whose message would have fit the frame.
        assert_eq!(
            CLASSIC.decode_frame(&[0x10, 0x04, 0x01, 0x02, 0x03, 0x04]),
            Err(CodecError::InvalidLength)
        );
        assert_eq!(
            CLASSIC.decode_frame(&[0x30, 0x00]),
            Err(CodecError::ShortBuffer)
        );
        assert_eq!(CLASSIC.decode_frame(&[0x21]), Err(CodecError::ShortBuffer));
    }

    #[test]
    fn test_round_trip_all_frame_kinds() {
        let mut buffer = [0u8; 64];

        let length = CLASSIC.encode_single_frame(&[1, 2, 3], &mut buffer).unwrap();
        assert_eq!(
            CLASSIC.decode_frame(&buffer[..length]).unwrap(),
            Frame::Single { payload: &[1, 2, 3] }
        );

        let length = CLASSIC
            .encode_first_frame(20, &[1, 2, 3, 4, 5, 6], &mut buffer)
            .unwrap();
        assert_eq!(
            CLASSIC.decode_frame(&buffer[..length]).unwrap(),
            Frame::First {
                total_length: 20,
                payload: &[1, 2, 3, 4, 5, 6]
            }
        );

        let length = CLASSIC
            .encode_consecutive_frame(5, &[9, 8, 7], &mut buffer)
            .unwrap();
        assert_eq!(
            CLASSIC.decode_frame(&buffer[..length]).unwrap(),
            Frame::Consecutive {
                sequence_number: 5,
                payload: &[9, 8, 7]
            }
        );

        let length = CLASSIC
            .encode_flow_control_frame(FlowStatus::Cts, 2, 0xf1, &mut buffer)
            .unwrap();
        assert_eq!(
            CLASSIC.decode_frame(&buffer[..length]).unwrap(),
            Frame::FlowControl {
                status: FlowStatus::Cts,
                block_size: 2,
                encoded_min_separation_time: 0xf1
            }
        );

        let payload = [0x42u8; 20];
        let length = FD.encode_single_frame(&payload, &mut buffer).unwrap();
        assert_eq!(
            FD.decode_frame(&buffer[..length]).unwrap(),
            Frame::Single { payload: &payload }
        );
    }

    #[test]
    fn test_encode_payload_size_errors() {
        let mut buffer = [0u8; 64];
        assert_eq!(
            CLASSIC.encode_single_frame(&[], &mut buffer),
            Err(CodecError::InvalidPayloadSize)
        );
        assert_eq!(
            CLASSIC.encode_single_frame(&[0u8; 8], &mut buffer),
            Err(CodecError::InvalidPayloadSize)
        );
        // First frame initial chunk must exactly fill the frame.
        assert_eq!(
            CLASSIC.encode_first_frame(15, &[1, 2, 3], &mut buffer),
            Err(CodecError::InvalidPayloadSize)
        );
        assert_eq!(
            CLASSIC.encode_consecutive_frame(1, &[0u8; 8], &mut buffer),
            Err(CodecError::InvalidPayloadSize)
        );
    }

    #[test]
    fn test_encode_short_buffer() {
        let mut buffer = [0u8; 4];
        assert_eq!(
            CLASSIC.encode_single_frame(&[1, 2, 3, 4, 5], &mut buffer),
            Err(CodecError::ShortBuffer)
        );
        assert_eq!(
            PADDED.encode_flow_control_frame(FlowStatus::Cts, 0, 0, &mut buffer),
            Err(CodecError::ShortBuffer)
        );
    }
}

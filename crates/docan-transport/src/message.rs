/// Error returned when a payload length does not fit the wrapped buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTooSmallError;

/// A transport message over a caller supplied buffer.
///
/// The payload length selects the active prefix of the buffer; the valid
/// byte count tracks how much of that prefix holds meaningful data. A
/// message is *complete* once every payload byte is valid, which is the
/// precondition for sending it and the postcondition of a finished
/// reception.
pub struct TransportMessage<'m> {
    buffer: &'m mut [u8],
    source_id: u16,
    target_id: u16,
    payload_length: usize,
    valid_bytes: usize,
}

impl<'m> core::fmt::Debug for TransportMessage<'m> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransportMessage")
            .field("source_id", &self.source_id)
            .field("target_id", &self.target_id)
            .field("payload_length", &self.payload_length)
            .field("valid_bytes", &self.valid_bytes)
            .finish_non_exhaustive()
    }
}

impl<'m> TransportMessage<'m> {
    pub fn new(buffer: &'m mut [u8]) -> Self {
        Self {
            buffer,
            source_id: 0,
            target_id: 0,
            payload_length: 0,
            valid_bytes: 0,
        }
    }

    pub fn source_id(&self) -> u16 {
        self.source_id
    }

    pub fn set_source_id(&mut self, source_id: u16) {
        self.source_id = source_id;
    }

    pub fn target_id(&self) -> u16 {
        self.target_id
    }

    pub fn set_target_id(&mut self, target_id: u16) {
        self.target_id = target_id;
    }

    /// Total capacity of the wrapped buffer.
    pub fn buffer_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length
    }

    /// Sets the payload length and resets the valid byte count.
    pub fn set_payload_length(&mut self, length: usize) -> Result<(), BufferTooSmallError> {
        if length > self.buffer.len() {
            return Err(BufferTooSmallError);
        }
        self.payload_length = length;
        self.valid_bytes = 0;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.payload_length]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.payload_length]
    }

    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    /// Marks `count` further payload bytes as valid.
    pub fn increase_valid_bytes(&mut self, count: usize) {
        debug_assert!(self.valid_bytes + count <= self.payload_length);
        self.valid_bytes += count;
    }

    /// Returns `true` once all payload bytes are valid.
    pub fn is_complete(&self) -> bool {
        self.valid_bytes >= self.payload_length
    }
}

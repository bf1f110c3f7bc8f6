//! Protocol state machine for the reception of a single message.

/// Reception states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveState {
    /// Waiting for a message buffer from the upper layer.
    Allocate,
    /// Buffer allocated, consecutive frames are being collected.
    Receive,
    /// The complete message has been delivered and awaits the upper
    /// layer's processed notification.
    Processing,
    /// The reception has finished (successfully or not).
    Done,
}

/// The timeout the scheduler has to arm for the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveTimeout {
    None,
    /// Waiting before retrying the buffer allocation.
    Allocation,
    /// Waiting for the next consecutive frame.
    Reception,
}

/// Diagnostics emitted by the handler together with a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveMessage {
    None,
    /// No buffer could be allocated within the allowed retries.
    AllocationRetryCountExceeded,
    /// A consecutive frame carried an unexpected sequence number.
    BadSequenceNumber,
    /// The next consecutive frame did not arrive in time.
    ReceptionTimeoutExpired,
}

/// Result of handling an event; a transition means the timer indicated
/// by the handler has to be re-armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveResult {
    transitioned: bool,
    message: ReceiveMessage,
}

impl ReceiveResult {
    pub fn new(transitioned: bool) -> Self {
        Self {
            transitioned,
            message: ReceiveMessage::None,
        }
    }

    pub fn with_message(mut self, message: ReceiveMessage) -> Self {
        self.message = message;
        self
    }

    pub fn has_transition(&self) -> bool {
        self.transitioned
    }

    pub fn message(&self) -> ReceiveMessage {
        self.message
    }
}

/// State machine driving the reception of one message.
///
/// The owning receiver performs the actual buffer allocation, payload
/// copying and flow control emission; the handler tracks the state,
/// sequence number, block countdown and allocation retries.
pub struct ReceiveProtocolHandler {
    state: ReceiveState,
    timeout: ReceiveTimeout,
    expected_sequence_number: u8,
    remaining_block_size: u8,
    allocation_attempt_count: u8,
}

impl ReceiveProtocolHandler {
    pub fn new() -> Self {
        Self {
            state: ReceiveState::Allocate,
            timeout: ReceiveTimeout::Allocation,
            expected_sequence_number: 1,
            remaining_block_size: 0,
            allocation_attempt_count: 0,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn timeout(&self) -> ReceiveTimeout {
        self.timeout
    }

    pub fn is_done(&self) -> bool {
        self.state == ReceiveState::Done
    }

    pub fn expected_sequence_number(&self) -> u8 {
        self.expected_sequence_number
    }

    /// Buffer allocation succeeded. A segmented reception starts
    /// collecting consecutive frames, a single frame message goes
    /// straight to processing.
    pub fn allocated(&mut self, segmented: bool) -> ReceiveResult {
        if segmented {
            self.state = ReceiveState::Receive;
            self.timeout = ReceiveTimeout::Reception;
            self.expected_sequence_number = 1;
        } else {
            self.state = ReceiveState::Processing;
            self.timeout = ReceiveTimeout::None;
        }
        ReceiveResult::new(true)
    }

    /// Buffer allocation failed; another attempt follows after the
    /// allocation timeout.
    pub fn allocation_failed(&mut self) -> ReceiveResult {
        self.allocation_attempt_count = self.allocation_attempt_count.saturating_add(1);
        self.timeout = ReceiveTimeout::Allocation;
        ReceiveResult::new(true)
    }

    /// Starts a new block of `block_size` consecutive frames (0 means
    /// no further flow control until the end of the message).
    pub fn begin_block(&mut self, block_size: u8) {
        self.remaining_block_size = block_size;
    }

    pub fn sequence_expected(&self, sequence_number: u8) -> bool {
        sequence_number == self.expected_sequence_number
    }

    pub fn advance_sequence(&mut self) {
        self.expected_sequence_number = (self.expected_sequence_number + 1) & 0xf;
    }

    /// Counts a received frame against the current block. Returns `true`
    /// when the block is used up and a new flow control is due.
    pub fn block_consumed(&mut self) -> bool {
        if self.remaining_block_size > 0 {
            self.remaining_block_size -= 1;
            return self.remaining_block_size == 0;
        }
        false
    }

    /// A valid consecutive frame arrived; the reception timeout starts
    /// over.
    pub fn frame_received(&mut self) -> ReceiveResult {
        self.timeout = ReceiveTimeout::Reception;
        ReceiveResult::new(true)
    }

    /// All payload bytes have been received; the message is handed to
    /// the upper layer.
    pub fn complete(&mut self) -> ReceiveResult {
        self.state = ReceiveState::Processing;
        self.timeout = ReceiveTimeout::None;
        ReceiveResult::new(true)
    }

    /// The upper layer reported the delivered message as processed.
    pub fn processed(&mut self) -> ReceiveResult {
        self.state = ReceiveState::Done;
        self.timeout = ReceiveTimeout::None;
        ReceiveResult::new(true)
    }

    /// Terminates the reception with the given diagnostic.
    pub fn fail(&mut self, message: ReceiveMessage) -> ReceiveResult {
        self.state = ReceiveState::Done;
        self.timeout = ReceiveTimeout::None;
        ReceiveResult::new(true).with_message(message)
    }

    pub fn cancel(&mut self) -> ReceiveResult {
        self.fail(ReceiveMessage::None)
    }

    /// The currently armed timeout has expired.
    pub fn expired(&mut self, max_allocation_attempts: u8) -> ReceiveResult {
        match self.timeout {
            ReceiveTimeout::Allocation => {
                if self.allocation_attempt_count >= max_allocation_attempts {
                    self.fail(ReceiveMessage::AllocationRetryCountExceeded)
                } else {
                    // Stay in the allocate state; the owner retries now.
                    ReceiveResult::new(true)
                }
            }
            ReceiveTimeout::Reception => self.fail(ReceiveMessage::ReceptionTimeoutExpired),
            ReceiveTimeout::None => ReceiveResult::new(false),
        }
    }
}

impl Default for ReceiveProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

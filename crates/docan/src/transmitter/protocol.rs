//! Protocol state machine for the transmission of a single message.

use bitflags::bitflags;

/// Transmission states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitState {
    /// The handler is initialized and waits for the signal to start.
    Initialized,
    /// A CAN frame should be sent.
    Send,
    /// The handler waits for an event.
    Wait,
    /// The transmission has completed.
    Success,
    /// The transmission has failed.
    Fail,
}

impl TransmitState {
    fn as_param(self) -> u8 {
        match self {
            TransmitState::Initialized => 0,
            TransmitState::Send => 1,
            TransmitState::Wait => 2,
            TransmitState::Success => 3,
            TransmitState::Fail => 4,
        }
    }
}

/// The timeout the scheduler has to arm for the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitTimeout {
    None,
    /// Waiting for the transmit confirmation of the driver.
    TxCallback,
    /// Waiting for a flow control frame from the peer.
    FlowControl,
    /// Waiting for the minimum separation time before the next frame.
    SeparationTime,
}

/// Diagnostics emitted by the handler together with a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitMessage {
    None,
    /// An event occurred in an unexpected state.
    IllegalState,
    /// The transmit confirmation of the last frame did not arrive.
    TxCallbackTimeoutExpired,
    /// The maximum number of WAIT flow control frames was exceeded.
    FlowControlWaitCountExceeded,
    /// An overflow flow control frame has been received.
    FlowControlOverflow,
    /// The expected flow control frame did not arrive.
    FlowControlTimeoutExpired,
    /// An invalid flow control frame has been received.
    FlowControlInvalid,
}

bitflags! {
    /// Actions the caller has to perform after a transition.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TransmitActions: u8 {
        /// The received separation time needs to be stored.
        const STORE_SEPARATION_TIME = 0x01;
        /// A pending driver send should be canceled.
        const CANCEL_SEND = 0x02;
    }
}

/// Result of handling an event. `has_transition` indicates that the state
/// (and therefore the timeout to arm) has changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransmitResult {
    transitioned: bool,
    actions: TransmitActions,
    message: TransmitMessage,
    param: u8,
}

impl TransmitResult {
    pub fn new(transitioned: bool) -> Self {
        Self {
            transitioned,
            actions: TransmitActions::empty(),
            message: TransmitMessage::None,
            param: 0,
        }
    }

    pub fn with_actions(mut self, actions: TransmitActions) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_message(mut self, message: TransmitMessage) -> Self {
        self.message = message;
        self.param = 0;
        self
    }

    pub fn with_message_param(mut self, message: TransmitMessage, param: u8) -> Self {
        self.message = message;
        self.param = param;
        self
    }

    pub fn has_transition(&self) -> bool {
        self.transitioned
    }

    pub fn actions(&self) -> TransmitActions {
        self.actions
    }

    pub fn message(&self) -> TransmitMessage {
        self.message
    }

    pub fn param(&self) -> u8 {
        self.param
    }
}

/// Inner flow control expectation, resolving the race between a flow
/// control frame and the transmit confirmation of the last frame of a
/// block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlowControlState {
    Unexpected,
    Expected,
    ReceivedCts,
    ReceivedWait,
}

/// State machine driving the transmission of one message.
///
/// Inputs arrive from three sides: the scheduler (`start`, `expired`),
/// the frame driver (`frame_sending`, `frames_sent`) and the peer
/// (`handle_flow_control`). Every input returns a [`TransmitResult`]
/// telling the caller whether to re-arm the timer indicated by
/// [`timeout`](Self::timeout) and which bookkeeping actions to perform.
pub struct TransmitProtocolHandler {
    frame_index: u16,
    frame_count: u16,
    block_end: u16,
    state: TransmitState,
    timeout: TransmitTimeout,
    flow_control: FlowControlState,
    error_message: TransmitMessage,
    flow_control_wait_count: u8,
    has_min_separation_time: bool,
}

impl TransmitProtocolHandler {
    pub fn new(frame_count: u16) -> Self {
        Self {
            frame_index: 0,
            frame_count,
            block_end: 1,
            state: TransmitState::Initialized,
            timeout: TransmitTimeout::None,
            flow_control: FlowControlState::Unexpected,
            error_message: TransmitMessage::None,
            flow_control_wait_count: 0,
            has_min_separation_time: false,
        }
    }

    pub fn state(&self) -> TransmitState {
        self.state
    }

    pub fn timeout(&self) -> TransmitTimeout {
        self.timeout
    }

    /// Index of the next frame to transmit.
    pub fn frame_index(&self) -> u16 {
        self.frame_index
    }

    /// Index one past the last frame of the current block.
    pub fn block_end(&self) -> u16 {
        self.block_end
    }

    pub fn frame_count(&self) -> u16 {
        self.frame_count
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, TransmitState::Success | TransmitState::Fail)
    }

    pub fn error_message(&self) -> TransmitMessage {
        self.error_message
    }

    /// Starts the transmission, typically from the owning task context.
    pub fn start(&mut self) -> TransmitResult {
        self.set_send()
    }

    /// Cancels the transmission and moves to the failed state.
    pub fn cancel(&mut self, message: TransmitMessage) -> TransmitResult {
        self.set_failed(message, 0)
    }

    /// The driver reports that it began transmitting a frame.
    pub fn frame_sending(&mut self) -> TransmitResult {
        if self.state == TransmitState::Send {
            let next_frame_index = self.frame_index + 1;
            if next_frame_index == self.block_end && next_frame_index != self.frame_count {
                self.flow_control_wait_count = 0;
                return self.set_state(
                    TransmitState::Wait,
                    FlowControlState::Expected,
                    TransmitTimeout::TxCallback,
                );
            }
            return self.set_state(
                TransmitState::Wait,
                FlowControlState::Unexpected,
                TransmitTimeout::TxCallback,
            );
        }
        self.set_failed(TransmitMessage::IllegalState, self.state.as_param())
    }

    /// The driver confirms that `frame_count` frames have left the bus.
    pub fn frames_sent(&mut self, frame_count: u16) -> TransmitResult {
        if (self.state != TransmitState::Wait) || (self.timeout != TransmitTimeout::TxCallback) {
            return TransmitResult::new(true)
                .with_message_param(TransmitMessage::IllegalState, self.state.as_param());
        }

        self.frame_index += frame_count;
        if self.frame_index >= self.frame_count {
            return self.set_state(
                TransmitState::Success,
                FlowControlState::Unexpected,
                TransmitTimeout::None,
            );
        }

        if frame_count > 1 && self.frame_index >= self.block_end {
            self.frame_index = self.block_end;
            self.flow_control = FlowControlState::Expected;
        }
        match self.flow_control {
            FlowControlState::ReceivedCts => self.set_send(),
            FlowControlState::ReceivedWait | FlowControlState::Expected => {
                self.set_state(TransmitState::Wait, self.flow_control, TransmitTimeout::FlowControl)
            }
            _ => {
                if self.has_min_separation_time {
                    self.set_state(
                        TransmitState::Wait,
                        FlowControlState::Unexpected,
                        TransmitTimeout::SeparationTime,
                    )
                } else {
                    self.set_send()
                }
            }
        }
    }

    /// Processes a received flow control frame. Unexpected flow control
    /// frames are ignored without a transition.
    pub fn handle_flow_control(
        &mut self,
        status: crate::datalink::FlowStatus,
        block_size: u8,
        has_min_separation_time: bool,
        max_wait_count: u8,
    ) -> TransmitResult {
        use crate::datalink::FlowStatus;

        if self.flow_control != FlowControlState::Expected {
            return TransmitResult::new(false);
        }

        match status {
            FlowStatus::Cts => {
                self.block_end = if block_size > 0 {
                    self.block_end.saturating_add(u16::from(block_size))
                } else {
                    self.frame_count
                };
                self.has_min_separation_time = has_min_separation_time;
                if self.timeout == TransmitTimeout::FlowControl {
                    let _ = self.set_send();
                    return TransmitResult::new(true)
                        .with_actions(TransmitActions::STORE_SEPARATION_TIME);
                }

                self.flow_control = FlowControlState::ReceivedCts;
                TransmitResult::new(false).with_actions(TransmitActions::STORE_SEPARATION_TIME)
            }
            FlowStatus::Wait => {
                if self.flow_control_wait_count < max_wait_count {
                    self.flow_control_wait_count += 1;
                    if self.timeout == TransmitTimeout::FlowControl {
                        return self.set_state(
                            TransmitState::Wait,
                            FlowControlState::Expected,
                            TransmitTimeout::FlowControl,
                        );
                    }

                    self.flow_control = FlowControlState::ReceivedWait;
                    return TransmitResult::new(false);
                }

                self.set_failed(TransmitMessage::FlowControlWaitCountExceeded, 0)
            }
            FlowStatus::Overflow => self.set_failed(TransmitMessage::FlowControlOverflow, 0),
            FlowStatus::Invalid => self.set_failed(TransmitMessage::FlowControlInvalid, 0),
        }
    }

    /// The currently armed timeout has expired.
    pub fn expired(&mut self) -> TransmitResult {
        match self.timeout {
            TransmitTimeout::TxCallback => {
                self.set_failed(TransmitMessage::TxCallbackTimeoutExpired, 0)
            }
            TransmitTimeout::FlowControl => {
                self.set_failed(TransmitMessage::FlowControlTimeoutExpired, 0)
            }
            TransmitTimeout::SeparationTime => self.set_send(),
            TransmitTimeout::None => TransmitResult::new(false),
        }
    }

    fn set_send(&mut self) -> TransmitResult {
        self.state = TransmitState::Send;
        self.flow_control = FlowControlState::Unexpected;
        self.timeout = TransmitTimeout::TxCallback;
        TransmitResult::new(true)
    }

    fn set_state(
        &mut self,
        state: TransmitState,
        flow_control: FlowControlState,
        timeout: TransmitTimeout,
    ) -> TransmitResult {
        self.state = state;
        self.flow_control = flow_control;
        self.timeout = timeout;
        TransmitResult::new(true)
    }

    fn set_failed(&mut self, message: TransmitMessage, param: u8) -> TransmitResult {
        let mut actions = TransmitActions::empty();
        if self.state == TransmitState::Wait && self.timeout == TransmitTimeout::TxCallback {
            actions |= TransmitActions::CANCEL_SEND;
        }
        self.state = TransmitState::Fail;
        self.flow_control = FlowControlState::Unexpected;
        self.timeout = TransmitTimeout::None;
        self.error_message = message;
        TransmitResult::new(true)
            .with_message_param(message, param)
            .with_actions(actions)
    }
}

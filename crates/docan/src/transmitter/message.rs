//! Per-message send state: addresses, payload accounting and timer.

use docan_transport::{TransportMessage, TransportMessageProcessedListener};

use crate::datalink::{AddressPair, DataLinkLayer, FlowStatus, FrameCodec};
use crate::job::JobHandle;
use crate::timer::DeadlineTimer;
use crate::transmitter::protocol::{
    TransmitActions, TransmitProtocolHandler, TransmitResult,
};

/// State of a single outbound message, embedded in the transmitter pool.
///
/// The entity owns the transport message for the duration of the job and
/// borrows the codec resolved for its connection. While the driver
/// encodes frames the message is temporarily moved out through
/// [`take_message`](Self::take_message), so its payload can be lent
/// without holding any lock.
pub struct MessageTransmitter<'p, 'm, DL: DataLinkLayer> {
    handler: TransmitProtocolHandler,
    codec: &'p FrameCodec,
    message: Option<TransportMessage<'m>>,
    listener: Option<&'p dyn TransportMessageProcessedListener<'m>>,
    reception_address: DL::Address,
    transmission_address: DL::Address,
    source_id: u16,
    target_id: u16,
    job_handle: JobHandle,
    min_separation_time_us: u32,
    timer: DeadlineTimer,
    bytes_sent: usize,
    consecutive_frame_data_size: u8,
    is_sending_consecutive_frames: bool,
}

impl<'p, 'm, DL: DataLinkLayer> MessageTransmitter<'p, 'm, DL> {
    pub fn new(
        job_handle: JobHandle,
        codec: &'p FrameCodec,
        address_pair: AddressPair<DL::Address>,
        message: TransportMessage<'m>,
        listener: Option<&'p dyn TransportMessageProcessedListener<'m>>,
        frame_count: u16,
        consecutive_frame_data_size: u8,
    ) -> Self {
        let source_id = message.source_id();
        let target_id = message.target_id();
        Self {
            handler: TransmitProtocolHandler::new(frame_count),
            codec,
            message: Some(message),
            listener,
            reception_address: address_pair.reception_address(),
            transmission_address: address_pair.transmission_address(),
            source_id,
            target_id,
            job_handle,
            min_separation_time_us: 0,
            timer: DeadlineTimer::default(),
            bytes_sent: 0,
            consecutive_frame_data_size,
            is_sending_consecutive_frames: false,
        }
    }

    pub fn handler(&self) -> &TransmitProtocolHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut TransmitProtocolHandler {
        &mut self.handler
    }

    pub fn job_handle(&self) -> JobHandle {
        self.job_handle
    }

    pub fn codec(&self) -> &'p FrameCodec {
        self.codec
    }

    pub fn listener(&self) -> Option<&'p dyn TransportMessageProcessedListener<'m>> {
        self.listener
    }

    pub fn reception_address(&self) -> DL::Address {
        self.reception_address
    }

    pub fn transmission_address(&self) -> DL::Address {
        self.transmission_address
    }

    pub fn source_id(&self) -> u16 {
        self.source_id
    }

    pub fn target_id(&self) -> u16 {
        self.target_id
    }

    pub fn consecutive_frame_data_size(&self) -> u8 {
        self.consecutive_frame_data_size
    }

    pub fn min_separation_time_us(&self) -> u32 {
        self.min_separation_time_us
    }

    /// Number of payload bytes already confirmed as sent; the unsent tail
    /// of the message payload starts here.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Moves the message out for lending its payload to the driver.
    pub fn take_message(&mut self) -> Option<TransportMessage<'m>> {
        self.message.take()
    }

    pub fn put_message(&mut self, message: TransportMessage<'m>) {
        debug_assert!(self.message.is_none());
        self.message = Some(message);
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some()
    }

    /// Processes a received flow control frame and caches the decoded
    /// minimum separation time when the handler asks for it.
    pub fn handle_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        min_separation_time_us: u32,
        max_wait_count: u8,
    ) -> TransmitResult {
        let result = self.handler.handle_flow_control(
            status,
            block_size,
            min_separation_time_us > 0,
            max_wait_count,
        );
        if result
            .actions()
            .contains(TransmitActions::STORE_SEPARATION_TIME)
        {
            self.min_separation_time_us = min_separation_time_us;
        }
        result
    }

    /// Accounts `data_size` sent payload bytes, then advances the
    /// protocol handler by `frame_count` frames.
    pub fn frames_sent(&mut self, frame_count: u16, data_size: usize) -> TransmitResult {
        self.bytes_sent += data_size;
        self.handler.frames_sent(frame_count)
    }

    /// Invalidates the job's external state before the entity is swept.
    pub fn release(&mut self) {
        self.job_handle = JobHandle::default();
        self.reception_address = DL::INVALID_ADDRESS;
        self.transmission_address = DL::INVALID_ADDRESS;
    }

    pub fn is_sending_consecutive_frames(&self) -> bool {
        self.is_sending_consecutive_frames
    }

    /// Arms the timer. `is_consecutive_frames` marks a separation time
    /// wait, which the owning transmitter counts for tick generation.
    pub fn set_timer(&mut self, expiry_us: u32, is_consecutive_frames: bool) {
        self.timer.set(expiry_us);
        self.is_sending_consecutive_frames = is_consecutive_frames;
    }

    pub fn timer_expired(&self, now_us: u32) -> bool {
        self.timer.expired(now_us)
    }

    /// Returns `true` exactly once when the armed timer becomes due.
    pub fn update_timer(&mut self, now_us: u32) -> bool {
        self.timer.update(now_us)
    }

    /// Ordering by `(is_timer_set, expiry)` for the sorted job list.
    pub fn is_before(&self, other: &Self) -> bool {
        self.timer.is_before(&other.timer)
    }
}

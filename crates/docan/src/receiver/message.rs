//! Per-message receive state: addresses, reassembly buffer and timer.

use docan_transport::TransportMessage;

use crate::addressing::TransportAddressPair;
use crate::datalink::{DataLinkLayer, FrameCodec};
use crate::job::JobHandle;
use crate::receiver::protocol::ReceiveProtocolHandler;
use crate::timer::DeadlineTimer;

/// Outcome of appending a consecutive frame payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The frame carries fewer bytes than this position requires; it is
    /// dropped without advancing the reception.
    TooShort,
    /// Payload stored, more frames expected.
    Progress,
    /// The message is complete.
    Complete,
}

/// State of a single inbound message, embedded in the receiver pool.
///
/// `FRAME` is the maximum data size of a single data frame for the
/// served data link (7 for classic CAN); the initial payload of the
/// first frame is staged in an inline buffer of that size until the
/// upper layer provides the message buffer.
pub struct MessageReceiver<'p, 'm, DL: DataLinkLayer, const FRAME: usize> {
    handler: ReceiveProtocolHandler,
    codec: &'p FrameCodec,
    message: Option<TransportMessage<'m>>,
    reception_address: DL::Address,
    transmission_address: DL::Address,
    transport_pair: TransportAddressPair,
    job_handle: JobHandle,
    total_length: usize,
    bytes_received: usize,
    frame_count: u16,
    consecutive_frame_data_size: u8,
    first_frame: [u8; FRAME],
    first_frame_length: u8,
    timer: DeadlineTimer,
}

impl<'p, 'm, DL: DataLinkLayer, const FRAME: usize> MessageReceiver<'p, 'm, DL, FRAME> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_handle: JobHandle,
        codec: &'p FrameCodec,
        reception_address: DL::Address,
        transmission_address: DL::Address,
        transport_pair: TransportAddressPair,
        total_length: usize,
        frame_count: u16,
        consecutive_frame_data_size: u8,
        initial_payload: &[u8],
    ) -> Self {
        debug_assert!(initial_payload.len() <= FRAME);
        let mut first_frame = [0u8; FRAME];
        let staged = initial_payload.len().min(FRAME);
        first_frame[..staged].copy_from_slice(&initial_payload[..staged]);
        Self {
            handler: ReceiveProtocolHandler::new(),
            codec,
            message: None,
            reception_address,
            transmission_address,
            transport_pair,
            job_handle,
            total_length,
            bytes_received: 0,
            frame_count,
            consecutive_frame_data_size,
            first_frame,
            first_frame_length: staged as u8,
            timer: DeadlineTimer::default(),
        }
    }

    pub fn handler(&self) -> &ReceiveProtocolHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut ReceiveProtocolHandler {
        &mut self.handler
    }

    pub fn job_handle(&self) -> JobHandle {
        self.job_handle
    }

    pub fn codec(&self) -> &'p FrameCodec {
        self.codec
    }

    pub fn reception_address(&self) -> DL::Address {
        self.reception_address
    }

    pub fn transmission_address(&self) -> DL::Address {
        self.transmission_address
    }

    pub fn transport_pair(&self) -> TransportAddressPair {
        self.transport_pair
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn is_segmented(&self) -> bool {
        self.frame_count > 1
    }

    /// The staged initial payload of the first frame.
    pub fn first_frame_payload(&self) -> &[u8] {
        &self.first_frame[..usize::from(self.first_frame_length)]
    }

    /// Adopts the allocated buffer: sizes it, stamps the transport
    /// addresses and copies the staged initial payload. A buffer too
    /// small for the message is handed back.
    pub fn accept_message(
        &mut self,
        mut message: TransportMessage<'m>,
    ) -> Result<(), TransportMessage<'m>> {
        if message.set_payload_length(self.total_length).is_err() {
            return Err(message);
        }
        message.set_source_id(self.transport_pair.source_id());
        message.set_target_id(self.transport_pair.target_id());
        let staged = usize::from(self.first_frame_length);
        message.payload_mut()[..staged].copy_from_slice(&self.first_frame[..staged]);
        message.increase_valid_bytes(staged);
        self.bytes_received = staged;
        self.message = Some(message);
        Ok(())
    }

    /// Appends a consecutive frame payload. A non-final frame must carry
    /// the full consecutive frame data size, the final one at least the
    /// remainder; trailing padding bytes are ignored.
    pub fn append_consecutive(&mut self, payload: &[u8]) -> AppendOutcome {
        let Some(message) = self.message.as_mut() else {
            return AppendOutcome::TooShort;
        };
        let remaining = self.total_length - self.bytes_received;
        let needed = remaining.min(usize::from(self.consecutive_frame_data_size));
        if payload.len() < needed {
            return AppendOutcome::TooShort;
        }
        message.payload_mut()[self.bytes_received..self.bytes_received + needed]
            .copy_from_slice(&payload[..needed]);
        message.increase_valid_bytes(needed);
        self.bytes_received += needed;
        if self.bytes_received == self.total_length {
            AppendOutcome::Complete
        } else {
            AppendOutcome::Progress
        }
    }

    pub fn take_message(&mut self) -> Option<TransportMessage<'m>> {
        self.message.take()
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some()
    }

    /// Invalidates the job's external state before the entity is swept.
    pub fn release(&mut self) {
        self.job_handle = JobHandle::default();
        self.reception_address = DL::INVALID_ADDRESS;
        self.transmission_address = DL::INVALID_ADDRESS;
    }

    pub fn set_timer(&mut self, expiry_us: u32) {
        self.timer.set(expiry_us);
    }

    pub fn update_timer(&mut self, now_us: u32) -> bool {
        self.timer.update(now_us)
    }

    pub fn is_before(&self, other: &Self) -> bool {
        self.timer.is_before(&other.timer)
    }
}

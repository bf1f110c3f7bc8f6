//! Data link abstraction: address types, frame codec and the driver
//! boundary.

mod codec;

pub use codec::{CodecError, FlowStatus, Frame, FrameCodec, FrameCodecConfig};

use crate::job::JobHandle;

/// Type bundle describing a concrete data link.
///
/// Only the address representation varies between links; message sizes,
/// frame indices and frame sizes use fixed width integers sized for the
/// largest supported encoding (32 bit escape lengths, 16 bit frame
/// counts). Whether a link runs classic CAN or CAN FD is a property of
/// the [`FrameCodec`] configuration, not of this bundle.
pub trait DataLinkLayer {
    type Address: Copy + PartialEq + Eq + core::fmt::Debug;

    /// Reserved address marking "no address". Used for functional
    /// (answerless) reception and for invalidating released jobs.
    const INVALID_ADDRESS: Self::Address;
}

/// A pair of data link addresses: one for reception, one for
/// transmission. The pair is valid iff the two addresses differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressPair<A: Copy> {
    reception: A,
    transmission: A,
}

impl<A: Copy + PartialEq> AddressPair<A> {
    pub const fn new(reception: A, transmission: A) -> Self {
        Self {
            reception,
            transmission,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.reception != self.transmission
    }

    pub fn reception_address(&self) -> A {
        self.reception
    }

    pub fn transmission_address(&self) -> A {
        self.transmission
    }
}

/// Outcome of a request to send a range of data frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendResult {
    /// The frames have been queued; the driver has room for more.
    Queued,
    /// The frames have been queued and the driver is now saturated.
    QueuedFull,
    /// Nothing was queued; retry later.
    Full,
    /// The request is invalid or the driver failed permanently.
    Failed,
}

/// Confirmation callback of a [`DataFrameTransmitter`].
pub trait DataFrameTransmitterCallback {
    /// Reports that `frame_count` frames carrying `data_size` payload
    /// bytes of the given job have left the driver. Must be invoked
    /// strictly after the corresponding `start_send_data_frames` call has
    /// returned.
    fn data_frames_sent(&self, job: JobHandle, frame_count: u16, data_size: usize);
}

/// Driver side interface for sending data frames of a transfer job.
pub trait DataFrameTransmitter<DL: DataLinkLayer> {
    /// Starts sending the frames `first_frame_index..end_frame_index` of
    /// a send job. `data` is the not yet transmitted tail of the message
    /// payload; the driver encodes it into frames using `codec` and
    /// reports progress through `callback`.
    #[allow(clippy::too_many_arguments)]
    fn start_send_data_frames(
        &self,
        codec: &FrameCodec,
        callback: &dyn DataFrameTransmitterCallback,
        job: JobHandle,
        transmission_address: DL::Address,
        first_frame_index: u16,
        end_frame_index: u16,
        consecutive_frame_data_size: u8,
        data: &[u8],
    ) -> SendResult;

    /// Cancels a pending send job. No further callback will be delivered
    /// for the job afterwards.
    fn cancel_send_data_frames(&self, callback: &dyn DataFrameTransmitterCallback, job: JobHandle);
}

/// Driver side interface for emitting flow control frames.
pub trait FlowControlFrameTransmitter<DL: DataLinkLayer> {
    /// Sends a single flow control frame. Returns `true` if the frame was
    /// accepted for transmission.
    fn send_flow_control(
        &self,
        codec: &FrameCodec,
        transmission_address: DL::Address,
        status: FlowStatus,
        block_size: u8,
        encoded_min_separation_time: u8,
    ) -> bool;
}

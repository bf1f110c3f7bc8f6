//! Host side harness that wires a DoCAN transmitter and receiver back to
//! back over an in-memory loopback data link. Runs one complete message
//! transfer, including segmentation, flow control and separation time,
//! and verifies the reassembled payload.
//!
//! ```text
//! cargo run -p docan-tester -- --size 300 --block-size 4 --st-min-ms 1
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Instant;

use clap::Parser;

use docan::addressing::{AddressResolver, Connection, TransportAddressPair};
use docan::datalink::{
    AddressPair, DataFrameTransmitter, DataFrameTransmitterCallback, DataLinkLayer,
    FlowControlFrameTransmitter, FlowStatus, Frame, FrameCodec, FrameCodecConfig, SendResult,
};
use docan::job::JobHandle;
use docan::parameters::DoCanParameters;
use docan::receiver::DoCanReceiver;
use docan::transmitter::{DoCanTransmitter, TickGenerator};
use docan_common::context::ExecutionContext;
use docan_transport::{
    ProcessingResult, ProviderError, TransportMessage, TransportMessageListener,
    TransportMessageProcessedListener, TransportMessageProvider,
};

struct HostLink;

impl DataLinkLayer for HostLink {
    type Address = u32;
    const INVALID_ADDRESS: u32 = 0xffff_ffff;
}

const CODEC: FrameCodec = FrameCodec::new(FrameCodecConfig::OPTIMIZED_CLASSIC);

/// CAN id the transmitter sends data frames on (= the receiver's
/// reception address).
const DATA_ADDRESS: u32 = 0x7a1;
/// CAN id flow control frames travel on in the opposite direction.
const FLOW_CONTROL_ADDRESS: u32 = 0x7a9;

const SOURCE: u16 = 0x45;
const TARGET: u16 = 0x54;

#[derive(Parser, Debug)]
struct Args {
    /// Message length in bytes.
    #[clap(long, default_value_t = 64)]
    size: usize,

    /// Block size advertised by the receiver (0 = a single flow control
    /// for the whole message).
    #[clap(long, default_value_t = 0)]
    block_size: u8,

    /// Minimum separation time advertised by the receiver, in
    /// milliseconds.
    #[clap(long, default_value_t = 0)]
    st_min_ms: u32,
}

/// In-memory CAN bus: raw frames plus pending transmit confirmations.
#[derive(Default)]
struct LoopbackBus {
    data_frames: RefCell<VecDeque<Vec<u8>>>,
    flow_control_frames: RefCell<VecDeque<Vec<u8>>>,
    confirmations: RefCell<VecDeque<(JobHandle, u16, usize)>>,
}

impl DataFrameTransmitter<HostLink> for LoopbackBus {
    fn start_send_data_frames(
        &self,
        codec: &FrameCodec,
        _callback: &dyn DataFrameTransmitterCallback,
        job: JobHandle,
        _transmission_address: u32,
        first_frame_index: u16,
        end_frame_index: u16,
        consecutive_frame_data_size: u8,
        data: &[u8],
    ) -> SendResult {
        let mut frame = [0u8; 64];
        let mut offset = 0usize;
        let mut frames_sent = 0u16;
        for index in first_frame_index..end_frame_index {
            let length = if index == 0 {
                if end_frame_index == 1 && data.len() <= codec.single_frame_capacity() {
                    let length = codec.encode_single_frame(data, &mut frame).unwrap();
                    offset = data.len();
                    length
                } else {
                    let chunk = codec.first_frame_data_size(data.len());
                    let length = codec
                        .encode_first_frame(data.len(), &data[..chunk], &mut frame)
                        .unwrap();
                    offset = chunk;
                    length
                }
            } else {
                let chunk = (data.len() - offset).min(usize::from(consecutive_frame_data_size));
                let length = codec
                    .encode_consecutive_frame(
                        (index & 0xf) as u8,
                        &data[offset..offset + chunk],
                        &mut frame,
                    )
                    .unwrap();
                offset += chunk;
                length
            };
            log::debug!("data frame: {:02x?}", &frame[..length]);
            self.data_frames
                .borrow_mut()
                .push_back(frame[..length].to_vec());
            frames_sent += 1;
        }
        self.confirmations
            .borrow_mut()
            .push_back((job, frames_sent, offset));
        SendResult::Queued
    }

    fn cancel_send_data_frames(&self, _callback: &dyn DataFrameTransmitterCallback, job: JobHandle) {
        log::warn!("send job {:?} canceled", job);
    }
}

impl FlowControlFrameTransmitter<HostLink> for LoopbackBus {
    fn send_flow_control(
        &self,
        codec: &FrameCodec,
        _transmission_address: u32,
        status: FlowStatus,
        block_size: u8,
        encoded_min_separation_time: u8,
    ) -> bool {
        let mut frame = [0u8; 64];
        let length = codec
            .encode_flow_control_frame(status, block_size, encoded_min_separation_time, &mut frame)
            .unwrap();
        log::debug!("flow control frame: {:02x?}", &frame[..length]);
        self.flow_control_frames
            .borrow_mut()
            .push_back(frame[..length].to_vec());
        true
    }
}

/// The layer above the transport: supplies receive buffers, consumes
/// delivered messages and verifies their content.
struct Upper<'m> {
    free: RefCell<Vec<TransportMessage<'m>>>,
    inbound: RefCell<VecDeque<TransportMessage<'m>>>,
    received_count: Cell<usize>,
    corrupt: Cell<bool>,
}

impl<'m> Upper<'m> {
    fn new(buffers: Vec<TransportMessage<'m>>) -> Self {
        Self {
            free: RefCell::new(buffers),
            inbound: RefCell::new(VecDeque::new()),
            received_count: Cell::new(0),
            corrupt: Cell::new(false),
        }
    }
}

impl<'m> TransportMessageProvider<'m> for Upper<'m> {
    fn get_transport_message(
        &self,
        _bus_id: u8,
        source_id: u16,
        target_id: u16,
        size: usize,
        peek: &[u8],
    ) -> Result<TransportMessage<'m>, ProviderError> {
        log::debug!(
            "buffer request 0x{:x} -> 0x{:x}, {} bytes, peek {:02x?}",
            source_id,
            target_id,
            size,
            peek
        );
        let mut free = self.free.borrow_mut();
        match free.iter().position(|message| message.buffer_length() >= size) {
            Some(index) => Ok(free.swap_remove(index)),
            None => Err(ProviderError::NoMessageAvailable),
        }
    }

    fn release_transport_message(&self, message: TransportMessage<'m>) {
        self.free.borrow_mut().push(message);
    }
}

impl<'m> TransportMessageListener<'m> for Upper<'m> {
    fn message_received(
        &self,
        _bus_id: u8,
        message: TransportMessage<'m>,
        _processed_listener: Option<&dyn TransportMessageProcessedListener<'m>>,
    ) -> Result<(), TransportMessage<'m>> {
        log::info!(
            "received message 0x{:x} -> 0x{:x}, {} bytes",
            message.source_id(),
            message.target_id(),
            message.payload_length()
        );
        if !message
            .payload()
            .iter()
            .enumerate()
            .all(|(index, &byte)| byte == payload_byte(index))
        {
            log::error!("payload mismatch!");
            self.corrupt.set(true);
        }
        self.received_count.set(self.received_count.get() + 1);
        self.inbound.borrow_mut().push_back(message);
        Ok(())
    }
}

/// Completion listener of the sending side.
#[derive(Default)]
struct SendDoneListener {
    result: Cell<Option<ProcessingResult>>,
}

impl<'m> TransportMessageProcessedListener<'m> for SendDoneListener {
    fn transport_message_processed(&self, message: TransportMessage<'m>, result: ProcessingResult) {
        log::info!(
            "send of {} bytes finished: {:?}",
            message.payload_length(),
            result
        );
        self.result.set(Some(result));
    }
}

struct StaticResolver;

impl AddressResolver<HostLink> for StaticResolver {
    fn transmission_parameters(
        &self,
        transport_pair: TransportAddressPair,
    ) -> Option<(AddressPair<u32>, &FrameCodec)> {
        (transport_pair == TransportAddressPair::new(SOURCE, TARGET))
            .then_some((AddressPair::new(FLOW_CONTROL_ADDRESS, DATA_ADDRESS), &CODEC))
    }
}

#[derive(Default)]
struct PendingContext {
    pending: Cell<bool>,
}

impl ExecutionContext for PendingContext {
    fn schedule(&self) {
        self.pending.set(true);
    }
}

struct NoTick;

impl TickGenerator for NoTick {
    fn tick_needed(&self) {}
}

fn payload_byte(index: usize) -> u8 {
    (index * 7 + 3) as u8
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let start = Instant::now();
    let now_fn = move || start.elapsed().as_micros() as u32;
    let parameters = DoCanParameters::new(
        &now_fn,
        100,
        200,
        300,
        400,
        2,
        3,
        args.st_min_ms * 1000,
        args.block_size,
    );

    // One receive buffer owned by the upper layer, one send buffer.
    let mut receive_buffer = vec![0u8; args.size];
    let mut send_buffer: Vec<u8> = (0..args.size).map(payload_byte).collect();

    let bus = LoopbackBus::default();
    let upper = Upper::new(vec![TransportMessage::new(&mut receive_buffer)]);
    let resolver = StaticResolver;
    let tx_context = PendingContext::default();
    let rx_context = PendingContext::default();
    let tick = NoTick;
    let send_done = SendDoneListener::default();

    let transmitter: DoCanTransmitter<HostLink, 4> =
        DoCanTransmitter::new(0, &tx_context, &bus, &tick, &resolver, &parameters);
    let receiver: DoCanReceiver<HostLink, 7, 4> =
        DoCanReceiver::new(0, &rx_context, &upper, &bus, &parameters);

    let mut message = TransportMessage::new(&mut send_buffer);
    let length = message.buffer_length();
    message.set_payload_length(length).unwrap();
    message.increase_valid_bytes(length);
    message.set_source_id(SOURCE);
    message.set_target_id(TARGET);

    log::info!(
        "sending {} bytes, block size {}, st_min {} ms",
        args.size,
        args.block_size,
        args.st_min_ms
    );
    transmitter
        .send(message, Some(&send_done))
        .expect("send accepted");

    let connection = || {
        Connection::<HostLink>::new(
            &CODEC,
            AddressPair::new(DATA_ADDRESS, FLOW_CONTROL_ADDRESS),
            TransportAddressPair::new(SOURCE, TARGET),
        )
    };

    while send_done.result.get().is_none() || !receiver.is_idle() {
        if start.elapsed().as_secs() > 5 {
            log::error!("transfer did not finish in time");
            std::process::exit(1);
        }
        let now_us = now_fn();

        if tx_context.pending.replace(false) {
            transmitter.process();
        }
        if rx_context.pending.replace(false) {
            receiver.process();
        }

        // Transmit confirmations from the driver. Popped one at a time
        // so the queue is not borrowed while the stack runs (it may
        // push follow-up work).
        loop {
            let confirmation = bus.confirmations.borrow_mut().pop_front();
            let Some((job, frames, bytes)) = confirmation else {
                break;
            };
            transmitter.data_frames_sent(job, frames, bytes);
        }

        // Data frames towards the receiver.
        loop {
            let frame = bus.data_frames.borrow_mut().pop_front();
            let Some(raw) = frame else {
                break;
            };
            match CODEC.decode_frame(&raw) {
                Ok(Frame::Single { payload }) => receiver.first_data_frame_received(
                    connection(),
                    payload.len(),
                    1,
                    CODEC.consecutive_frame_data_size() as u8,
                    payload,
                ),
                Ok(Frame::First {
                    total_length,
                    payload,
                }) => {
                    let (frame_count, consecutive_size) =
                        CODEC.encoded_frame_count(total_length as usize).unwrap();
                    receiver.first_data_frame_received(
                        connection(),
                        total_length as usize,
                        frame_count,
                        consecutive_size,
                        payload,
                    );
                }
                Ok(Frame::Consecutive {
                    sequence_number,
                    payload,
                }) => receiver.consecutive_data_frame_received(
                    DATA_ADDRESS,
                    sequence_number,
                    payload,
                ),
                Ok(Frame::FlowControl { .. }) => log::error!("flow control on the data bus"),
                Err(error) => log::error!("undecodable frame {:02x?}: {:?}", raw, error),
            }
        }

        // Flow control frames back towards the transmitter.
        loop {
            let frame = bus.flow_control_frames.borrow_mut().pop_front();
            let Some(raw) = frame else {
                break;
            };
            match CODEC.decode_frame(&raw) {
                Ok(Frame::FlowControl {
                    status,
                    block_size,
                    encoded_min_separation_time,
                }) => transmitter.flow_control_frame_received(
                    FLOW_CONTROL_ADDRESS,
                    status,
                    block_size,
                    encoded_min_separation_time,
                ),
                other => log::error!("unexpected frame on the flow control path: {:?}", other),
            }
        }

        // Delivered messages are processed immediately.
        loop {
            let delivered = upper.inbound.borrow_mut().pop_front();
            let Some(message) = delivered else {
                break;
            };
            receiver.transport_message_processed(message, ProcessingResult::NoError);
        }

        transmitter.cyclic_task(now_us);
        receiver.cyclic_task(now_us);
    }

    transmitter.shutdown();
    receiver.shutdown();

    if send_done.result.get() != Some(ProcessingResult::NoError)
        || upper.received_count.get() != 1
        || upper.corrupt.get()
    {
        log::error!("transfer failed");
        std::process::exit(1);
    }
    log::info!("transfer complete");
}

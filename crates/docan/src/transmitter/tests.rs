use core::cell::{Cell, RefCell};

use heapless::Vec;

use docan_common::context::ExecutionContext;
use docan_transport::{
    ProcessingResult, TransportLayerError, TransportMessage, TransportMessageProcessedListener,
};

use crate::addressing::{AddressResolver, TransportAddressPair};
use crate::datalink::{
    AddressPair, DataFrameTransmitter, DataFrameTransmitterCallback, DataLinkLayer, FlowStatus,
    FrameCodec, FrameCodecConfig, SendResult,
};
use crate::job::JobHandle;
use crate::parameters::DoCanParameters;

use super::{DoCanTransmitter, TickGenerator};

struct TestLink;

impl DataLinkLayer for TestLink {
    type Address = u32;
    const INVALID_ADDRESS: u32 = 0xffff_ffff;
}

const CODEC: FrameCodec = FrameCodec::new(FrameCodecConfig::OPTIMIZED_CLASSIC);

#[derive(Debug, PartialEq, Eq)]
struct SendCall {
    job: JobHandle,
    address: u32,
    first_frame_index: u16,
    end_frame_index: u16,
    consecutive_frame_data_size: u8,
    data: Vec<u8, 72>,
}

#[derive(Default)]
struct FrameTransmitterMock {
    calls: RefCell<Vec<SendCall, 16>>,
    results: RefCell<Vec<SendResult, 16>>,
    cancels: RefCell<Vec<JobHandle, 8>>,
}

impl FrameTransmitterMock {
    fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next `start_send_data_frames` call;
    /// without a queued result the mock answers `QueuedFull`.
    fn push_result(&self, result: SendResult) {
        self.results.borrow_mut().push(result).unwrap();
    }

    fn take_calls(&self) -> Vec<SendCall, 16> {
        core::mem::take(&mut *self.calls.borrow_mut())
    }
}

impl DataFrameTransmitter<TestLink> for FrameTransmitterMock {
    fn start_send_data_frames(
        &self,
        _codec: &FrameCodec,
        _callback: &dyn DataFrameTransmitterCallback,
        job: JobHandle,
        transmission_address: u32,
        first_frame_index: u16,
        end_frame_index: u16,
        consecutive_frame_data_size: u8,
        data: &[u8],
    ) -> SendResult {
        let mut copy = Vec::new();
        copy.extend_from_slice(data).unwrap();
        self.calls
            .borrow_mut()
            .push(SendCall {
                job,
                address: transmission_address,
                first_frame_index,
                end_frame_index,
                consecutive_frame_data_size,
                data: copy,
            })
            .unwrap();
        let mut results = self.results.borrow_mut();
        if results.is_empty() {
            SendResult::QueuedFull
        } else {
            results.remove(0)
        }
    }

    fn cancel_send_data_frames(&self, _callback: &dyn DataFrameTransmitterCallback, job: JobHandle) {
        self.cancels.borrow_mut().push(job).unwrap();
    }
}

#[derive(Default)]
struct ResolverMock {
    routes: RefCell<Vec<(TransportAddressPair, AddressPair<u32>), 4>>,
}

impl ResolverMock {
    fn with_route(transport: TransportAddressPair, address_pair: AddressPair<u32>) -> Self {
        let resolver = Self::default();
        resolver.add_route(transport, address_pair);
        resolver
    }

    fn add_route(&self, transport: TransportAddressPair, address_pair: AddressPair<u32>) {
        self.routes
            .borrow_mut()
            .push((transport, address_pair))
            .unwrap();
    }
}

impl AddressResolver<TestLink> for ResolverMock {
    fn transmission_parameters(
        &self,
        transport_pair: TransportAddressPair,
    ) -> Option<(AddressPair<u32>, &FrameCodec)> {
        self.routes
            .borrow()
            .iter()
            .find(|(pair, _)| *pair == transport_pair)
            .map(|(_, address_pair)| (*address_pair, &CODEC))
    }
}

#[derive(Default)]
struct ContextMock {
    scheduled: Cell<usize>,
}

impl ExecutionContext for ContextMock {
    fn schedule(&self) {
        self.scheduled.set(self.scheduled.get() + 1);
    }
}

#[derive(Default)]
struct TickMock {
    ticks: Cell<usize>,
}

impl TickGenerator for TickMock {
    fn tick_needed(&self) {
        self.ticks.set(self.ticks.get() + 1);
    }
}

#[derive(Default)]
struct ListenerMock {
    events: RefCell<Vec<(u16, u16, ProcessingResult), 8>>,
}

impl<'m> TransportMessageProcessedListener<'m> for ListenerMock {
    fn transport_message_processed(&self, message: TransportMessage<'m>, result: ProcessingResult) {
        self.events
            .borrow_mut()
            .push((message.source_id(), message.target_id(), result))
            .unwrap();
    }
}

fn make_message<'m>(buffer: &'m mut [u8], source: u16, target: u16) -> TransportMessage<'m> {
    let mut message = TransportMessage::new(buffer);
    let length = message.buffer_length();
    message.set_payload_length(length).unwrap();
    message.increase_valid_bytes(length);
    message.set_source_id(source);
    message.set_target_id(target);
    message
}

const SOURCE: u16 = 0x45;
const TARGET: u16 = 0x54;
const RX_ADDRESS: u32 = 0x1234;
const TX_ADDRESS: u32 = 0x5678;

fn transport_pair() -> TransportAddressPair {
    TransportAddressPair::new(SOURCE, TARGET)
}

fn address_pair() -> AddressPair<u32> {
    AddressPair::new(RX_ADDRESS, TX_ADDRESS)
}

macro_rules! fixture {
    ($now:ident, $parameters:ident, $frame_tx:ident, $tick:ident, $context:ident, $resolver:ident, $listener:ident) => {
        let $now = Cell::new(0u32);
        let now_fn = || $now.get();
        let $parameters = DoCanParameters::new(&now_fn, 100, 200, 300, 400, 2, 3, 0, 0);
        let $frame_tx = FrameTransmitterMock::new();
        let $tick = TickMock::default();
        let $context = ContextMock::default();
        let $resolver = ResolverMock::with_route(transport_pair(), address_pair());
        let $listener = ListenerMock::default();
    };
}

#[test]
fn test_transmit_single_frame_message() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0xab, 0xcd, 0xef, 0x19, 0x28];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    // The send job only starts from the owning context.
    assert_eq!(context.scheduled.get(), 1);
    assert!(frame_tx.calls.borrow().is_empty());

    cut.process();
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].address, TX_ADDRESS);
    assert_eq!(calls[0].first_frame_index, 0);
    assert_eq!(calls[0].end_frame_index, 1);
    assert_eq!(calls[0].consecutive_frame_data_size, 0);
    assert_eq!(calls[0].data.as_slice(), &[0xab, 0xcd, 0xef, 0x19, 0x28]);
    let job = calls[0].job;

    cut.data_frames_sent(job, 1, 5);
    // The completion notification is deferred to the owning context.
    assert!(listener.events.borrow().is_empty());
    cut.process();
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::NoError)]
    );
    assert!(cut.is_idle());
    cut.shutdown();
}

#[test]
fn test_single_frame_messages_get_distinct_job_handles() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer1 = [0x01, 0x02, 0x03];
    let mut buffer2 = [0x04, 0x05, 0x06];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer1, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.send(make_message(&mut buffer2, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let first_job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(first_job, 1, 3);
    let second_job = frame_tx.take_calls()[0].job;
    assert_ne!(first_job, second_job);
    cut.data_frames_sent(second_job, 1, 3);
    cut.process();
    assert_eq!(listener.events.borrow().len(), 2);
    assert!(cut.is_idle());
}

#[test]
fn test_transmit_without_notification_listener() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = &listener;
    let mut buffer = [0x11, 0x22];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), None).unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 2);
    cut.process();
    assert!(cut.is_idle());
}

#[test]
fn test_transmit_segmented_message() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [
        0xab, 0xcd, 0xef, 0x19, 0x28, 0x98, 0xa1, 0x45, 0x11, 0x22, 0x33, 0x44, 0x55, 0x67, 0x9e,
    ];
    let data = buffer;
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].first_frame_index, 0);
    assert_eq!(calls[0].end_frame_index, 1);
    assert_eq!(calls[0].consecutive_frame_data_size, 7);
    assert_eq!(calls[0].data.as_slice(), &data);
    let job = calls[0].job;

    cut.data_frames_sent(job, 1, 6);
    assert!(frame_tx.calls.borrow().is_empty());

    // Clear to send without block limit resumes immediately.
    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Cts, 0, 0);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].job, job);
    assert_eq!(calls[0].first_frame_index, 1);
    assert_eq!(calls[0].end_frame_index, 3);
    assert_eq!(calls[0].data.as_slice(), &data[6..]);

    cut.data_frames_sent(job, 1, 7);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].first_frame_index, 2);
    assert_eq!(calls[0].end_frame_index, 3);
    assert_eq!(calls[0].data.as_slice(), &data[13..]);

    cut.data_frames_sent(job, 1, 2);
    cut.process();
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::NoError)]
    );
    assert!(cut.is_idle());
}

#[test]
fn test_flow_control_overflow_aborts_with_error_overflow() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);

    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Overflow, 0, 0);
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorOverflow)]
    );
    assert!(cut.is_idle());
}

#[test]
fn test_invalid_flow_control_aborts_with_error_abort() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);

    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Invalid, 0, 0);
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorAbort)]
    );
}

#[test]
fn test_flow_control_wait_count_exceeded() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);

    // max_flow_control_wait_count is 3: three WAITs are tolerated.
    for _ in 0..3 {
        cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Wait, 0, 0);
        assert!(listener.events.borrow().is_empty());
    }
    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Wait, 0, 0);
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorGeneral)]
    );
}

#[test]
fn test_separation_time_paces_consecutive_frames() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [
        0xab, 0xcd, 0xef, 0x19, 0x28, 0x98, 0xa1, 0x45, 0x11, 0x22, 0x33, 0x44, 0x55, 0x67, 0x9e,
    ];
    let data = buffer;
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);

    // Clear to send with a minimum separation time of 2 ms.
    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Cts, 0, 2);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    // A single frame per separation interval.
    assert_eq!(calls[0].first_frame_index, 1);
    assert_eq!(calls[0].end_frame_index, 2);

    cut.data_frames_sent(job, 1, 7);
    assert!(frame_tx.calls.borrow().is_empty());
    assert!(cut.is_sending_consecutive_frames());
    assert_eq!(tick.ticks.get(), 1);

    // Not due yet.
    cut.cyclic_task(0);
    cut.cyclic_task(1999);
    assert!(frame_tx.calls.borrow().is_empty());

    now.set(2000);
    cut.cyclic_task(2000);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].first_frame_index, 2);
    assert_eq!(calls[0].end_frame_index, 3);
    assert_eq!(calls[0].data.as_slice(), &data[13..]);
    assert!(!cut.is_sending_consecutive_frames());

    cut.data_frames_sent(job, 1, 2);
    cut.process();
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::NoError)]
    );
}

#[test]
fn test_separation_time_across_tick_wrap_around() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    now.set(u32::MAX - 999);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);
    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Cts, 0, 2);
    frame_tx.take_calls();
    cut.data_frames_sent(job, 1, 7);
    assert_eq!(tick.ticks.get(), 1);

    // The 2 ms separation timer expires past the wrap, at tick 1000.
    cut.cyclic_task(u32::MAX);
    cut.cyclic_task(999);
    assert!(frame_tx.calls.borrow().is_empty());
    now.set(1000);
    cut.cyclic_task(1000);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].first_frame_index, 2);
}

#[test]
fn test_second_segmented_send_for_same_pair_fails() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = &listener;
    let mut buffer1 = [0u8; 15];
    let mut buffer2 = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer1, SOURCE, TARGET), None).unwrap();
    let error = cut
        .send(make_message(&mut buffer2, SOURCE, TARGET), None)
        .unwrap_err();
    assert_eq!(error.error, TransportLayerError::SendFail);
    assert_eq!(error.message.payload_length(), 15);
}

#[test]
fn test_send_incomplete_message_fails() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = (&frame_tx, &listener);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    let mut message = TransportMessage::new(&mut buffer);
    message.set_payload_length(15).unwrap();
    message.increase_valid_bytes(10);
    message.set_source_id(SOURCE);
    message.set_target_id(TARGET);
    let error = cut.send(message, None).unwrap_err();
    assert_eq!(error.error, TransportLayerError::MessageIncomplete);
    assert_eq!(context.scheduled.get(), 0);
}

#[test]
fn test_send_empty_message_fails() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = (&frame_tx, &listener);
    let mut buffer = [0u8; 0];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    let error = cut
        .send(make_message(&mut buffer, SOURCE, TARGET), None)
        .unwrap_err();
    assert_eq!(error.error, TransportLayerError::GeneralError);
}

#[test]
fn test_send_unroutable_pair_fails() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = (&frame_tx, &listener);
    let mut buffer = [0u8; 5];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    let error = cut
        .send(make_message(&mut buffer, 0x99, 0x98), None)
        .unwrap_err();
    assert_eq!(error.error, TransportLayerError::SendFail);
}

#[test]
fn test_send_queue_full() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = &listener;
    let mut buffer1 = [0u8; 5];
    let mut buffer2 = [0x0au8; 5];
    // A single send slot.
    let cut: DoCanTransmitter<TestLink, 1> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer1, SOURCE, TARGET), None).unwrap();
    let error = cut
        .send(make_message(&mut buffer2, SOURCE, TARGET), None)
        .unwrap_err();
    assert_eq!(error.error, TransportLayerError::QueueFull);
    assert_eq!(error.message.payload(), &[0x0a; 5]);
}

#[test]
fn test_data_link_full_is_retried_from_cyclic_task() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0x11, 0x22, 0x33];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    frame_tx.push_result(SendResult::Full);
    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    // The driver rejected the frame; the job stays ready.
    assert_eq!(frame_tx.take_calls().len(), 1);

    cut.cyclic_task(1);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    let job = calls[0].job;
    cut.data_frames_sent(job, 1, 3);
    cut.process();
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::NoError)]
    );
}

#[test]
fn test_driver_failure_aborts_job() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0x11, 0x22, 0x33];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    frame_tx.push_result(SendResult::Failed);
    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorGeneral)]
    );
    assert!(cut.is_idle());
}

#[test]
fn test_tx_callback_timeout_cancels_driver_job() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0x11, 0x22, 0x33];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;

    // No confirmation arrives within the 300 ms tx callback timeout.
    now.set(300_000);
    cut.cyclic_task(300_000);
    assert_eq!(frame_tx.cancels.borrow().as_slice(), &[job]);
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorGeneral)]
    );
    assert!(cut.is_idle());
}

#[test]
fn test_flow_control_timeout_reports_error_timeout() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);

    // The 400 ms flow control timeout passes without a frame.
    now.set(400_000);
    cut.cyclic_task(400_000);
    assert!(frame_tx.cancels.borrow().is_empty());
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorTimeout)]
    );
}

#[test]
fn test_send_again_after_flow_control_timeout() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer1 = [0u8; 15];
    let mut buffer2 = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer1, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;
    cut.data_frames_sent(job, 1, 6);
    now.set(400_000);
    cut.cyclic_task(400_000);
    assert_eq!(listener.events.borrow().len(), 1);

    // The address pair is free again.
    cut.send(make_message(&mut buffer2, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_ne!(calls[0].job, job);
}

#[test]
fn test_callback_without_pending_job_is_ignored() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let _ = (&resolver, &listener);
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.data_frames_sent(JobHandle::new(0x99, 0x09), 1, 5);
    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Cts, 0, 0);
    assert!(cut.is_idle());
    assert_eq!(tick.ticks.get(), 0);
}

#[test]
fn test_round_robin_between_two_segmented_messages() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    resolver.add_route(
        TransportAddressPair::new(0x46, 0x55),
        AddressPair::new(0x2234, 0x2678),
    );
    let mut buffer_a = [0u8; 15];
    let mut buffer_b = [0u8; 15];
    for (index, byte) in buffer_a.iter_mut().enumerate() {
        *byte = index as u8;
    }
    for (index, byte) in buffer_b.iter_mut().enumerate() {
        *byte = 0x80 + index as u8;
    }
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer_a, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.send(make_message(&mut buffer_b, 0x46, 0x55), Some(&listener))
        .unwrap();
    cut.process();

    // First frame of message A; the driver is saturated after each
    // frame, so B's first frame goes out only after A's confirmation.
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].address, TX_ADDRESS);
    let job_a = calls[0].job;

    cut.data_frames_sent(job_a, 1, 6);
    let calls = frame_tx.take_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].address, 0x2678);
    let job_b = calls[0].job;

    cut.flow_control_frame_received(RX_ADDRESS, FlowStatus::Cts, 0, 0);
    assert!(frame_tx.calls.borrow().is_empty());
    cut.data_frames_sent(job_b, 1, 6);
    cut.flow_control_frame_received(0x2234, FlowStatus::Cts, 0, 0);
    cut.data_frames_sent(job_a, 1, 7);
    cut.data_frames_sent(job_b, 1, 7);
    cut.data_frames_sent(job_a, 1, 2);
    cut.data_frames_sent(job_b, 1, 2);

    // Every confirmation hands the bus to the other transfer.
    let calls = frame_tx.take_calls();
    let sequence: std::vec::Vec<(u32, u16)> = calls
        .iter()
        .map(|call| (call.address, call.first_frame_index))
        .collect();
    assert_eq!(
        sequence,
        &[
            (0x2678, 0),
            (TX_ADDRESS, 1),
            (0x2678, 1),
            (TX_ADDRESS, 2),
            (0x2678, 2)
        ]
    );

    cut.process();
    assert_eq!(listener.events.borrow().len(), 2);
    assert!(cut.is_idle());
}

#[test]
fn test_shutdown_aborts_pending_jobs() {
    fixture!(now, parameters, frame_tx, tick, context, resolver, listener);
    let mut buffer = [0u8; 15];
    let cut: DoCanTransmitter<TestLink, 5> =
        DoCanTransmitter::new(0xff, &context, &frame_tx, &tick, &resolver, &parameters);

    cut.send(make_message(&mut buffer, SOURCE, TARGET), Some(&listener))
        .unwrap();
    cut.process();
    let job = frame_tx.take_calls()[0].job;

    cut.shutdown();
    // The pending driver job is canceled and the listener notified.
    assert_eq!(frame_tx.cancels.borrow().as_slice(), &[job]);
    assert_eq!(
        listener.events.borrow().as_slice(),
        &[(SOURCE, TARGET, ProcessingResult::ErrorGeneral)]
    );
    assert!(cut.is_idle());
}

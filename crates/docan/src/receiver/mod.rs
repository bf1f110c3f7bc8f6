//! Receive side of the transport layer: reassembly of segmented
//! messages received over one CAN bus.

mod message;
pub mod protocol;

pub use message::{AppendOutcome, MessageReceiver};

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use docan_common::context::ExecutionContext;
use docan_common::pool::SlotPool;
use docan_common::{dev_error, dev_info, dev_warn};
use docan_transport::{
    ProcessingResult, ProviderError, TransportMessage, TransportMessageProcessedListener,
    TransportMessageProvidingListener,
};

use crate::addressing::{Connection, TransportAddressPair};
use crate::datalink::{DataLinkLayer, FlowControlFrameTransmitter, FlowStatus, FrameCodec};
use crate::job::JobHandle;
use crate::parameters::DoCanParameters;
use self::protocol::{ReceiveMessage, ReceiveResult, ReceiveState, ReceiveTimeout};

struct ReceiverState<'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize> {
    pool: SlotPool<MessageReceiver<'p, 'm, DL, FRAME>, N>,
    live: Vec<u16, N>,
    job_counter: u16,
    remove_lock_count: u8,
    released_count: u8,
    switch_context: bool,
    timers_updated: bool,
}

impl<'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize>
    ReceiverState<'p, 'm, DL, FRAME, N>
{
    fn find_slot_by_reception_address(&self, address: DL::Address) -> Option<usize> {
        self.live.iter().map(|&slot| usize::from(slot)).find(|&slot| {
            self.pool
                .get(slot)
                .is_some_and(|receiver| receiver.reception_address() == address)
        })
    }

    fn sort_live_by_timer(&mut self) {
        let pool = &self.pool;
        self.live.sort_unstable_by(|&a, &b| {
            use core::cmp::Ordering;
            match (pool.get(usize::from(a)), pool.get(usize::from(b))) {
                (Some(left), Some(right)) => {
                    if left.is_before(right) {
                        Ordering::Less
                    } else if right.is_before(left) {
                        Ordering::Greater
                    } else {
                        Ordering::Equal
                    }
                }
                _ => Ordering::Equal,
            }
        });
    }
}

/// Parameters of one allocation attempt, captured under the lock and
/// used with the lock released.
struct AllocationRequest<'p, DL: DataLinkLayer, const FRAME: usize> {
    transport_pair: TransportAddressPair,
    total_length: usize,
    codec: &'p FrameCodec,
    transmission_address: DL::Address,
    segmented: bool,
    peek: [u8; FRAME],
    peek_length: usize,
}

/// What a consecutive frame amounted to, decided under the lock and
/// acted upon with the lock released.
enum ConsecutiveAction<'p, DL: DataLinkLayer> {
    None,
    UnknownAddress,
    Unsolicited,
    TooShort,
    BadSequence,
    SendCts {
        codec: &'p FrameCodec,
        transmission_address: DL::Address,
    },
    Deliver {
        slot: usize,
    },
}

/// Receive side scheduler: a pool of up to `N` concurrent receptions.
///
/// First and consecutive data frames are delivered by the data link
/// frame receiver (with addressing already resolved); buffers come from
/// the injected providing listener, which also consumes completed
/// messages. The owning task context drives [`process`](Self::process)
/// and [`cyclic_task`](Self::cyclic_task). Lock discipline matches the
/// transmit side: short critical sections, all provider and driver calls
/// with the lock released, slot removal deferred until the outermost
/// list walk has finished.
pub struct DoCanReceiver<'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize> {
    state: Mutex<RefCell<ReceiverState<'p, 'm, DL, FRAME, N>>>,
    providing_listener: &'p dyn TransportMessageProvidingListener<'m>,
    flow_control_transmitter: &'p dyn FlowControlFrameTransmitter<DL>,
    parameters: &'p DoCanParameters<'p>,
    context: &'p dyn ExecutionContext,
    bus_id: u8,
}

impl<'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize>
    DoCanReceiver<'p, 'm, DL, FRAME, N>
{
    pub fn new(
        bus_id: u8,
        context: &'p dyn ExecutionContext,
        providing_listener: &'p dyn TransportMessageProvidingListener<'m>,
        flow_control_transmitter: &'p dyn FlowControlFrameTransmitter<DL>,
        parameters: &'p DoCanParameters<'p>,
    ) -> Self {
        Self {
            state: Mutex::new(RefCell::new(ReceiverState {
                pool: SlotPool::new(),
                live: Vec::new(),
                job_counter: 0,
                remove_lock_count: 0,
                released_count: 0,
                switch_context: false,
                timers_updated: false,
            })),
            providing_listener,
            flow_control_transmitter,
            parameters,
            context,
            bus_id,
        }
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut ReceiverState<'p, 'm, DL, FRAME, N>) -> R,
    ) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    /// Handles the first data frame of a message (also a single frame
    /// message, with `frame_count == 1`). The connection carries the
    /// resolved codec and addresses for this transfer.
    pub fn first_data_frame_received(
        &self,
        connection: Connection<'p, DL>,
        total_length: usize,
        frame_count: u16,
        consecutive_frame_data_size: u8,
        initial_payload: &[u8],
    ) {
        let address_pair = connection.address_pair();
        if frame_count > 1 && address_pair.transmission_address() == DL::INVALID_ADDRESS {
            dev_warn!(
                "DoCanReceiver({}): segmented message to functional address {:?} ignored",
                self.bus_id,
                address_pair.reception_address()
            );
            return;
        }
        let valid = total_length > 0
            && if frame_count <= 1 {
                initial_payload.len() == total_length && total_length <= FRAME
            } else {
                initial_payload.len() <= FRAME && initial_payload.len() < total_length
            };
        if !valid {
            dev_error!(
                "DoCanReceiver({}): invalid first frame received ({:?})",
                self.bus_id,
                address_pair.reception_address()
            );
            return;
        }

        let _guard = RemoveGuard::new(self, true);
        let (new_slot, replaced) = self.with_state(|state| {
            let mut replaced = false;
            if let Some(existing) =
                state.find_slot_by_reception_address(address_pair.reception_address())
            {
                let result = state
                    .pool
                    .get_mut(existing)
                    .map(|receiver| receiver.handler_mut().cancel());
                if let Some(result) = result {
                    self.handle_result(state, existing, result, "first_data_frame_received");
                }
                replaced = true;
            }
            if state.pool.is_full() {
                return (None, replaced);
            }
            state.job_counter = state.job_counter.wrapping_add(1);
            let counter = state.job_counter;
            let slot = state
                .pool
                .allocate_with(|slot| {
                    MessageReceiver::new(
                        JobHandle::new(counter, slot as u16),
                        connection.codec(),
                        address_pair.reception_address(),
                        address_pair.transmission_address(),
                        connection.transport_pair(),
                        total_length,
                        frame_count,
                        consecutive_frame_data_size,
                        initial_payload,
                    )
                })
                .unwrap();
            state.live.push(slot as u16).ok();
            (Some(slot), replaced)
        });
        if replaced {
            dev_info!(
                "DoCanReceiver({}): reception on {:?} replaced by new first frame",
                self.bus_id,
                address_pair.reception_address()
            );
        }
        let Some(slot) = new_slot else {
            dev_info!(
                "DoCanReceiver({}): no message receiver available, frame from {:?} dropped",
                self.bus_id,
                address_pair.reception_address()
            );
            return;
        };
        self.attempt_allocation(slot, false);
    }

    /// Handles a consecutive data frame addressed to a running
    /// reception.
    pub fn consecutive_data_frame_received(
        &self,
        reception_address: DL::Address,
        sequence_number: u8,
        payload: &[u8],
    ) {
        let _guard = RemoveGuard::new(self, true);
        let action = self.with_state(|state| {
            let Some(slot) = state.find_slot_by_reception_address(reception_address) else {
                return ConsecutiveAction::<DL>::UnknownAddress;
            };
            let Some(receiver) = state.pool.get_mut(slot) else {
                return ConsecutiveAction::None;
            };
            if receiver.handler().state() != ReceiveState::Receive {
                return ConsecutiveAction::Unsolicited;
            }
            if !receiver.handler().sequence_expected(sequence_number) {
                let result = receiver
                    .handler_mut()
                    .fail(ReceiveMessage::BadSequenceNumber);
                self.handle_result(state, slot, result, "consecutive_data_frame_received");
                return ConsecutiveAction::BadSequence;
            }
            match receiver.append_consecutive(payload) {
                AppendOutcome::TooShort => ConsecutiveAction::TooShort,
                AppendOutcome::Complete => {
                    let result = receiver.handler_mut().complete();
                    self.handle_result(state, slot, result, "consecutive_data_frame_received");
                    ConsecutiveAction::Deliver { slot }
                }
                AppendOutcome::Progress => {
                    receiver.handler_mut().advance_sequence();
                    let result = receiver.handler_mut().frame_received();
                    let need_cts = receiver.handler_mut().block_consumed();
                    let codec = receiver.codec();
                    let transmission_address = receiver.transmission_address();
                    if need_cts {
                        receiver
                            .handler_mut()
                            .begin_block(self.parameters.max_block_size());
                    }
                    self.handle_result(state, slot, result, "consecutive_data_frame_received");
                    if need_cts {
                        ConsecutiveAction::SendCts {
                            codec,
                            transmission_address,
                        }
                    } else {
                        ConsecutiveAction::None
                    }
                }
            }
        });
        match action {
            ConsecutiveAction::None => {}
            ConsecutiveAction::UnknownAddress => dev_warn!(
                "DoCanReceiver({}): consecutive frame from {:?} without reception",
                self.bus_id,
                reception_address
            ),
            ConsecutiveAction::Unsolicited => dev_warn!(
                "DoCanReceiver({}): unsolicited consecutive frame from {:?}",
                self.bus_id,
                reception_address
            ),
            ConsecutiveAction::TooShort => dev_warn!(
                "DoCanReceiver({}): too short consecutive frame from {:?}",
                self.bus_id,
                reception_address
            ),
            ConsecutiveAction::BadSequence => dev_warn!(
                "DoCanReceiver({}): Frame with bad sequence number received ({:?})",
                self.bus_id,
                reception_address
            ),
            ConsecutiveAction::SendCts {
                codec,
                transmission_address,
            } => self.send_cts(codec, transmission_address),
            ConsecutiveAction::Deliver { slot } => self.deliver(slot),
        }
    }

    /// Fires expired reception timers and retries due allocations. The
    /// live list is kept sorted by expiry, so the walk stops at the
    /// first timer that has not fired yet.
    pub fn cyclic_task(&self, now_us: u32) {
        {
            let _guard = RemoveGuard::new(self, true);
            let mut retry_slots: Vec<usize, N> = Vec::new();
            let mut index = 0;
            loop {
                let proceed = self.with_state(|state| {
                    if index >= state.live.len() {
                        return false;
                    }
                    let slot = usize::from(state.live[index]);
                    let Some(receiver) = state.pool.get_mut(slot) else {
                        return false;
                    };
                    if !receiver.update_timer(now_us) {
                        return false;
                    }
                    let result = receiver
                        .handler_mut()
                        .expired(self.parameters.max_allocate_retry_count());
                    self.handle_result(state, slot, result, "cyclic_task");
                    if state
                        .pool
                        .get(slot)
                        .is_some_and(|receiver| {
                            receiver.handler().state() == ReceiveState::Allocate
                        })
                    {
                        retry_slots.push(slot).ok();
                    }
                    true
                });
                if !proceed {
                    break;
                }
                index += 1;
            }
            for slot in retry_slots {
                self.attempt_allocation(slot, false);
            }
        }
        self.with_state(|state| {
            if state.timers_updated {
                state.sort_live_by_timer();
                state.timers_updated = false;
            }
        });
    }

    /// Deferred pass on the owning context: retries buffer allocation
    /// for waiting receptions (e.g. after a buffer became free) and
    /// sweeps finished entities.
    pub fn process(&self) {
        let _guard = RemoveGuard::new(self, true);
        let mut retry_slots: Vec<usize, N> = Vec::new();
        self.with_state(|state| {
            for &slot in state.live.iter() {
                let slot = usize::from(slot);
                if state
                    .pool
                    .get(slot)
                    .is_some_and(|receiver| receiver.handler().state() == ReceiveState::Allocate)
                {
                    retry_slots.push(slot).ok();
                }
            }
        });
        for slot in retry_slots {
            self.attempt_allocation(slot, true);
        }
    }

    /// `true` once no reception is outstanding.
    pub fn is_idle(&self) -> bool {
        self.with_state(|state| state.pool.is_empty())
    }

    /// Aborts every outstanding reception and returns all allocated
    /// buffers to the provider.
    pub fn shutdown(&self) {
        let _guard = RemoveGuard::new(self, true);
        let mut index = 0;
        loop {
            let proceed = self.with_state(|state| {
                if index >= state.live.len() {
                    return false;
                }
                let slot = usize::from(state.live[index]);
                let result = state
                    .pool
                    .get_mut(slot)
                    .filter(|receiver| !receiver.handler().is_done())
                    .map(|receiver| receiver.handler_mut().cancel());
                if let Some(result) = result {
                    self.handle_result(state, slot, result, "shutdown");
                }
                true
            });
            if !proceed {
                break;
            }
            index += 1;
        }
    }

    /// Tries to get a buffer for the reception in `slot`. Opportunistic
    /// attempts (from the deferred pass) fail silently; regular attempts
    /// count against the retry limit and answer segmented transfers with
    /// a WAIT flow control.
    fn attempt_allocation(&self, slot: usize, opportunistic: bool) {
        let request = self.with_state(|state| {
            let receiver = state.pool.get(slot)?;
            if receiver.handler().state() != ReceiveState::Allocate {
                return None;
            }
            let mut peek = [0u8; FRAME];
            let staged = receiver.first_frame_payload();
            peek[..staged.len()].copy_from_slice(staged);
            Some(AllocationRequest::<'p, DL, FRAME> {
                transport_pair: receiver.transport_pair(),
                total_length: receiver.total_length(),
                codec: receiver.codec(),
                transmission_address: receiver.transmission_address(),
                segmented: receiver.is_segmented(),
                peek,
                peek_length: staged.len(),
            })
        });
        let Some(request) = request else {
            return;
        };

        match self.providing_listener.get_transport_message(
            self.bus_id,
            request.transport_pair.source_id(),
            request.transport_pair.target_id(),
            request.total_length,
            &request.peek[..request.peek_length],
        ) {
            Ok(message) => {
                let rejected = self.with_state(move |state| {
                    let Some(receiver) = state.pool.get_mut(slot) else {
                        return Some(message);
                    };
                    match receiver.accept_message(message) {
                        Ok(()) => {
                            let segmented = receiver.is_segmented();
                            let result = receiver.handler_mut().allocated(segmented);
                            receiver
                                .handler_mut()
                                .begin_block(self.parameters.max_block_size());
                            self.handle_result(state, slot, result, "allocate");
                            None
                        }
                        Err(message) => Some(message),
                    }
                });
                if let Some(message) = rejected {
                    dev_warn!(
                        "DoCanReceiver({}): allocated buffer too small for 0x{:x} -> 0x{:x}",
                        self.bus_id,
                        request.transport_pair.source_id(),
                        request.transport_pair.target_id()
                    );
                    self.providing_listener.release_transport_message(message);
                    self.cancel_slot(slot);
                    return;
                }
                if request.segmented {
                    self.send_cts(request.codec, request.transmission_address);
                } else {
                    self.deliver(slot);
                }
            }
            Err(ProviderError::NoMessageAvailable) => {
                if opportunistic {
                    return;
                }
                self.with_state(|state| {
                    let result = state
                        .pool
                        .get_mut(slot)
                        .map(|receiver| receiver.handler_mut().allocation_failed());
                    if let Some(result) = result {
                        self.handle_result(state, slot, result, "allocate");
                    }
                });
                if request.segmented {
                    self.send_wait(request.codec, request.transmission_address);
                }
            }
            Err(error) => {
                match error {
                    ProviderError::InvalidSourceId => dev_warn!(
                        "DoCanReceiver({}): allocate(0x{:x} -> 0x{:x}): illegal source id",
                        self.bus_id,
                        request.transport_pair.source_id(),
                        request.transport_pair.target_id()
                    ),
                    ProviderError::InvalidTargetId => dev_warn!(
                        "DoCanReceiver({}): allocate(0x{:x} -> 0x{:x}): illegal target id",
                        self.bus_id,
                        request.transport_pair.source_id(),
                        request.transport_pair.target_id()
                    ),
                    _ => dev_warn!(
                        "DoCanReceiver({}): allocate(0x{:x} -> 0x{:x}): no buffer ({:?})",
                        self.bus_id,
                        request.transport_pair.source_id(),
                        request.transport_pair.target_id(),
                        error
                    ),
                }
                self.cancel_slot(slot);
            }
        }
    }

    /// Hands the completed message in `slot` to the upper layer.
    fn deliver(&self, slot: usize) {
        let message = self.with_state(|state| {
            state
                .pool
                .get_mut(slot)
                .and_then(|receiver| receiver.take_message())
        });
        let Some(message) = message else {
            return;
        };
        match self
            .providing_listener
            .message_received(self.bus_id, message, Some(self))
        {
            Ok(()) => {}
            Err(message) => {
                dev_warn!(
                    "DoCanReceiver({}): message 0x{:x} -> 0x{:x} rejected by listener",
                    self.bus_id,
                    message.source_id(),
                    message.target_id()
                );
                self.providing_listener.release_transport_message(message);
                self.cancel_slot(slot);
            }
        }
    }

    fn cancel_slot(&self, slot: usize) {
        self.with_state(|state| {
            let result = state
                .pool
                .get_mut(slot)
                .filter(|receiver| !receiver.handler().is_done())
                .map(|receiver| receiver.handler_mut().cancel());
            if let Some(result) = result {
                self.handle_result(state, slot, result, "cancel");
            }
        });
    }

    fn send_cts(&self, codec: &FrameCodec, transmission_address: DL::Address) {
        let sent = self.flow_control_transmitter.send_flow_control(
            codec,
            transmission_address,
            FlowStatus::Cts,
            self.parameters.max_block_size(),
            self.parameters.encoded_min_separation_time(),
        );
        if !sent {
            dev_warn!(
                "DoCanReceiver({}): flow control to {:?} not sent",
                self.bus_id,
                transmission_address
            );
        }
    }

    fn send_wait(&self, codec: &FrameCodec, transmission_address: DL::Address) {
        let sent = self.flow_control_transmitter.send_flow_control(
            codec,
            transmission_address,
            FlowStatus::Wait,
            0,
            0,
        );
        if !sent {
            dev_warn!(
                "DoCanReceiver({}): flow control to {:?} not sent",
                self.bus_id,
                transmission_address
            );
        }
    }

    /// Common bookkeeping after a protocol handler transition: re-arm
    /// the reception timer, queue done entities for the sweep and log
    /// diagnostics.
    fn handle_result(
        &self,
        state: &mut ReceiverState<'p, 'm, DL, FRAME, N>,
        slot: usize,
        result: ReceiveResult,
        operation: &str,
    ) {
        if result.has_transition() {
            self.reset_timer(state, slot);
            if let Some(receiver) = state.pool.get_mut(slot) {
                if receiver.handler().is_done() {
                    receiver.release();
                    debug_assert!(state.released_count != u8::MAX);
                    state.released_count += 1;
                    state.switch_context = true;
                } else {
                    state.timers_updated = true;
                }
            }
        }
        match result.message() {
            ReceiveMessage::None => {}
            ReceiveMessage::AllocationRetryCountExceeded => dev_warn!(
                "DoCanReceiver({}): {}: no buffer allocated within the retry limit",
                self.bus_id,
                operation
            ),
            ReceiveMessage::BadSequenceNumber => dev_warn!(
                "DoCanReceiver({}): {}: Frame with bad sequence number received",
                self.bus_id,
                operation
            ),
            ReceiveMessage::ReceptionTimeoutExpired => dev_warn!(
                "DoCanReceiver({}): {}: rx timeout expired",
                self.bus_id,
                operation
            ),
        }
    }

    fn reset_timer(&self, state: &mut ReceiverState<'p, 'm, DL, FRAME, N>, slot: usize) {
        let now_us = self.parameters.now_us();
        let Some(receiver) = state.pool.get_mut(slot) else {
            return;
        };
        match receiver.handler().timeout() {
            ReceiveTimeout::Allocation => {
                receiver.set_timer(now_us.wrapping_add(self.parameters.wait_allocate_timeout_us()))
            }
            ReceiveTimeout::Reception => {
                receiver.set_timer(now_us.wrapping_add(self.parameters.wait_rx_timeout_us()))
            }
            ReceiveTimeout::None => receiver.set_timer(now_us),
        }
    }

    fn set_remove_lock(&self) {
        self.with_state(|state| {
            debug_assert!(state.remove_lock_count != u8::MAX);
            state.remove_lock_count += 1;
        });
    }

    /// When the last lock holder leaves, done entities are swept out of
    /// the live list; buffers still held by them go back to the
    /// provider with no lock held.
    fn release_remove_lock(&self, remove: bool) {
        let mut released: Vec<TransportMessage<'m>, N> = Vec::new();
        let switch_context = self.with_state(|state| {
            debug_assert!(state.remove_lock_count != 0);
            state.remove_lock_count -= 1;
            if remove && state.remove_lock_count == 0 && state.released_count > 0 {
                let mut index = 0;
                while index < state.live.len() && state.released_count > 0 {
                    let slot = usize::from(state.live[index]);
                    let done = state
                        .pool
                        .get(slot)
                        .is_some_and(|receiver| receiver.handler().is_done());
                    if !done {
                        index += 1;
                        continue;
                    }
                    state.live.remove(index);
                    let mut receiver = state.pool.release(slot).unwrap();
                    state.released_count -= 1;
                    if let Some(message) = receiver.take_message() {
                        released.push(message).ok();
                    }
                }
            }
            let switch_context = state.switch_context;
            state.switch_context = false;
            switch_context
        });
        for message in released {
            self.providing_listener.release_transport_message(message);
        }
        if switch_context {
            self.context.schedule();
        }
    }
}

impl<'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize>
    TransportMessageProcessedListener<'m> for DoCanReceiver<'p, 'm, DL, FRAME, N>
{
    /// The upper layer has finished with a delivered message; the
    /// buffer goes back to the provider and the reception slot is
    /// freed.
    fn transport_message_processed(&self, message: TransportMessage<'m>, _result: ProcessingResult) {
        let _guard = RemoveGuard::new(self, true);
        self.with_state(|state| {
            let slot = state.live.iter().map(|&slot| usize::from(slot)).find(|&slot| {
                state.pool.get(slot).is_some_and(|receiver| {
                    receiver.handler().state() == ReceiveState::Processing
                        && !receiver.has_message()
                        && receiver.transport_pair().source_id() == message.source_id()
                        && receiver.transport_pair().target_id() == message.target_id()
                })
            });
            if let Some(slot) = slot {
                let result = state
                    .pool
                    .get_mut(slot)
                    .map(|receiver| receiver.handler_mut().processed());
                if let Some(result) = result {
                    self.handle_result(state, slot, result, "transport_message_processed");
                }
            }
        });
        self.providing_listener.release_transport_message(message);
    }
}

struct RemoveGuard<'g, 'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize> {
    receiver: &'g DoCanReceiver<'p, 'm, DL, FRAME, N>,
    remove: bool,
}

impl<'g, 'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize>
    RemoveGuard<'g, 'p, 'm, DL, FRAME, N>
{
    fn new(receiver: &'g DoCanReceiver<'p, 'm, DL, FRAME, N>, remove: bool) -> Self {
        receiver.set_remove_lock();
        Self { receiver, remove }
    }
}

impl<'g, 'p, 'm, DL: DataLinkLayer, const FRAME: usize, const N: usize> Drop
    for RemoveGuard<'g, 'p, 'm, DL, FRAME, N>
{
    fn drop(&mut self) {
        self.receiver.release_remove_lock(self.remove);
    }
}

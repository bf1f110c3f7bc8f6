//! Transmit side of the transport layer: parallel transmission of
//! transport messages over one CAN bus.

mod message;
pub mod protocol;

pub use message::MessageTransmitter;

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use docan_common::context::ExecutionContext;
use docan_common::pool::SlotPool;
use docan_common::{dev_info, dev_warn};
use docan_transport::{
    ProcessingResult, TransportLayerError, TransportMessage, TransportMessageProcessedListener,
};

use crate::addressing::{AddressResolver, TransportAddressPair};
use crate::datalink::{
    DataFrameTransmitter, DataFrameTransmitterCallback, DataLinkLayer, FlowStatus, SendResult,
};
use crate::job::JobHandle;
use crate::parameters::{DoCanParameters, decode_min_separation_time};
use self::protocol::{
    TransmitActions, TransmitMessage, TransmitResult, TransmitState, TransmitTimeout,
};

/// Interface towards the platform's tick rate control. While consecutive
/// frames are being paced by a separation time the transmitter asks for
/// extra cyclic task invocations through this trait.
pub trait TickGenerator {
    fn tick_needed(&self);
}

/// A failed `send`, handing the message back to the caller.
#[derive(Debug)]
pub struct SendError<'m> {
    pub error: TransportLayerError,
    pub message: TransportMessage<'m>,
}

struct TransmitterState<'p, 'm, DL: DataLinkLayer, const N: usize> {
    pool: SlotPool<MessageTransmitter<'p, 'm, DL>, N>,
    live: Vec<u16, N>,
    pending_cancels: Vec<JobHandle, N>,
    send_cursor: usize,
    job_counter: u16,
    remove_lock_count: u8,
    released_count: u8,
    sending_consecutive_frames_count: u8,
    send_lock: bool,
    pending_send: bool,
    switch_context: bool,
    timers_updated: bool,
}

impl<'p, 'm, DL: DataLinkLayer, const N: usize> TransmitterState<'p, 'm, DL, N> {
    fn find_slot_by_reception_address(&self, address: DL::Address) -> Option<usize> {
        self.live.iter().map(|&slot| usize::from(slot)).find(|&slot| {
            self.pool
                .get(slot)
                .is_some_and(|transmitter| transmitter.reception_address() == address)
        })
    }

    fn find_slot_by_job(&self, job: JobHandle) -> Option<usize> {
        self.live.iter().map(|&slot| usize::from(slot)).find(|&slot| {
            self.pool
                .get(slot)
                .is_some_and(|transmitter| transmitter.job_handle() == job)
        })
    }

    fn sort_live_by_timer(&mut self) {
        let cursor_slot = self.live.get(self.send_cursor).copied();
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
        if let Some(slot) = cursor_slot {
            self.send_cursor = self
                .live
                .iter()
                .position(|&candidate| candidate == slot)
                .unwrap_or(0);
        }
    }
}

/// Payload of one `start_send_data_frames` invocation, assembled under
/// the lock and used with the lock released.
struct PendingSend<'p, 'm, DL: DataLinkLayer> {
    slot: usize,
    job: JobHandle,
    codec: &'p crate::datalink::FrameCodec,
    transmission_address: DL::Address,
    frame_index: u16,
    block_end: u16,
    consecutive_frame_data_size: u8,
    bytes_sent: usize,
    message: TransportMessage<'m>,
}

/// A completed job, dispatched to its listener after the sweep.
struct Completion<'p, 'm> {
    message: TransportMessage<'m>,
    listener: Option<&'p dyn TransportMessageProcessedListener<'m>>,
    result: ProcessingResult,
}

/// Transmit side scheduler: a pool of up to `N` concurrent send jobs.
///
/// The owning task context drives [`process`](Self::process) and
/// [`cyclic_task`](Self::cyclic_task); the CAN driver delivers
/// [`data_frames_sent`](DataFrameTransmitterCallback::data_frames_sent)
/// and [`flow_control_frame_received`](Self::flow_control_frame_received)
/// from its own context. Shared state is kept behind short critical
/// sections; completion listeners run with no lock held, after the
/// triggering list walk has finished.
pub struct DoCanTransmitter<'p, 'm, DL: DataLinkLayer, const N: usize> {
    state: Mutex<RefCell<TransmitterState<'p, 'm, DL, N>>>,
    frame_transmitter: &'p dyn DataFrameTransmitter<DL>,
    tick_generator: &'p dyn TickGenerator,
    address_resolver: &'p dyn AddressResolver<DL>,
    parameters: &'p DoCanParameters<'p>,
    context: &'p dyn ExecutionContext,
    bus_id: u8,
}

impl<'p, 'm, DL: DataLinkLayer, const N: usize> DoCanTransmitter<'p, 'm, DL, N> {
    pub fn new(
        bus_id: u8,
        context: &'p dyn ExecutionContext,
        frame_transmitter: &'p dyn DataFrameTransmitter<DL>,
        tick_generator: &'p dyn TickGenerator,
        address_resolver: &'p dyn AddressResolver<DL>,
        parameters: &'p DoCanParameters<'p>,
    ) -> Self {
        Self {
            state: Mutex::new(RefCell::new(TransmitterState {
                pool: SlotPool::new(),
                live: Vec::new(),
                pending_cancels: Vec::new(),
                send_cursor: 0,
                job_counter: 0,
                remove_lock_count: 0,
                released_count: 0,
                sending_consecutive_frames_count: 0,
                send_lock: false,
                pending_send: false,
                switch_context: false,
                timers_updated: false,
            })),
            frame_transmitter,
            tick_generator,
            address_resolver,
            parameters,
            context,
            bus_id,
        }
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut TransmitterState<'p, 'm, DL, N>) -> R,
    ) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    /// Queues a transport message for transmission. The message must be
    /// complete; on failure it is handed back inside the error.
    pub fn send(
        &self,
        message: TransportMessage<'m>,
        listener: Option<&'p dyn TransportMessageProcessedListener<'m>>,
    ) -> Result<(), SendError<'m>> {
        let transport_pair =
            TransportAddressPair::new(message.source_id(), message.target_id());
        let Some((address_pair, codec)) = self
            .address_resolver
            .transmission_parameters(transport_pair)
        else {
            dev_warn!(
                "DoCanTransmitter({}): send(0x{:x} -> 0x{:x}): invalid source/target pair",
                self.bus_id,
                transport_pair.source_id(),
                transport_pair.target_id()
            );
            return Err(SendError {
                error: TransportLayerError::SendFail,
                message,
            });
        };
        if !message.is_complete() {
            return Err(SendError {
                error: TransportLayerError::MessageIncomplete,
                message,
            });
        }
        let Ok((frame_count, consecutive_frame_data_size)) =
            codec.encoded_frame_count(message.payload_length())
        else {
            return Err(SendError {
                error: TransportLayerError::GeneralError,
                message,
            });
        };

        let mut message = Some(message);
        let rejected = self.with_state(|state| {
            if frame_count > 1
                && state
                    .find_slot_by_reception_address(address_pair.reception_address())
                    .is_some()
            {
                return Some(TransportLayerError::SendFail);
            }
            if state.pool.is_full() {
                return Some(TransportLayerError::QueueFull);
            }
            state.job_counter = state.job_counter.wrapping_add(1);
            let counter = state.job_counter;
            let taken = message.take().unwrap();
            let slot = state
                .pool
                .allocate_with(|slot| {
                    MessageTransmitter::new(
                        JobHandle::new(counter, slot as u16),
                        codec,
                        address_pair,
                        taken,
                        listener,
                        frame_count,
                        consecutive_frame_data_size,
                    )
                })
                .unwrap();
            state.live.push(slot as u16).ok();
            None
        });

        match rejected {
            Some(error) => {
                match error {
                    TransportLayerError::SendFail => dev_warn!(
                        "DoCanTransmitter({}): send(0x{:x} -> 0x{:x}): already a segmented message for this source/target pair",
                        self.bus_id,
                        transport_pair.source_id(),
                        transport_pair.target_id()
                    ),
                    TransportLayerError::QueueFull => dev_warn!(
                        "DoCanTransmitter({}): send(0x{:x} -> 0x{:x}): no empty message transmitter found",
                        self.bus_id,
                        transport_pair.source_id(),
                        transport_pair.target_id()
                    ),
                    _ => {}
                }
                Err(SendError {
                    error,
                    message: message.take().unwrap(),
                })
            }
            None => {
                self.context.schedule();
                Ok(())
            }
        }
    }

    /// Deferred pass on the owning context: starts freshly queued jobs
    /// and dispatches pending completion notifications.
    pub fn process(&self) {
        let _guard = RemoveGuard::new(self, true);
        let mut index = 0;
        loop {
            let proceed = self.with_state(|state| {
                if index >= state.live.len() {
                    return false;
                }
                let slot = usize::from(state.live[index]);
                if let Some(transmitter) = state.pool.get_mut(slot) {
                    if transmitter.handler().state() == TransmitState::Initialized {
                        let result = transmitter.handler_mut().start();
                        self.handle_result(state, slot, result, "process");
                    }
                }
                true
            });
            if !proceed {
                break;
            }
            index += 1;
        }
        self.flush_cancels();
    }

    /// Processes a received flow control frame for the job sending on
    /// the given reception address.
    pub fn flow_control_frame_received(
        &self,
        reception_address: DL::Address,
        status: FlowStatus,
        block_size: u8,
        encoded_min_separation_time: u8,
    ) {
        let _guard = RemoveGuard::new(self, true);
        let found = self.with_state(|state| {
            let Some(slot) = state.find_slot_by_reception_address(reception_address) else {
                return false;
            };
            if let Some(transmitter) = state.pool.get_mut(slot) {
                let result = transmitter.handle_flow_control(
                    status,
                    block_size,
                    decode_min_separation_time(encoded_min_separation_time),
                    self.parameters.max_flow_control_wait_count(),
                );
                self.handle_result(state, slot, result, "flow_control_frame_received");
            }
            true
        });
        if !found {
            dev_warn!(
                "DoCanTransmitter({}): flow control for 0x{:?}: no message pending to be sent",
                self.bus_id,
                reception_address
            );
        }
        self.flush_cancels();
    }

    /// Fires expired job timers. The live list is kept sorted by expiry,
    /// so the walk stops at the first timer that has not fired yet.
    pub fn cyclic_task(&self, now_us: u32) {
        {
            let _guard = RemoveGuard::new(self, true);
            let mut index = 0;
            loop {
                let proceed = self.with_state(|state| {
                    if index >= state.live.len() {
                        return false;
                    }
                    let slot = usize::from(state.live[index]);
                    let Some(transmitter) = state.pool.get_mut(slot) else {
                        return false;
                    };
                    if !transmitter.update_timer(now_us) {
                        return false;
                    }
                    let result = transmitter.handler_mut().expired();
                    self.handle_result(state, slot, result, "cyclic_task");
                    true
                });
                if !proceed {
                    break;
                }
                index += 1;
            }
            self.flush_cancels();
        }
        self.with_state(|state| {
            if state.timers_updated {
                state.sort_live_by_timer();
                state.timers_updated = false;
            }
        });
    }

    /// `true` while any job is pacing consecutive frames with a
    /// separation time.
    pub fn is_sending_consecutive_frames(&self) -> bool {
        self.with_state(|state| state.sending_consecutive_frames_count > 0)
    }

    /// `true` once no send job is outstanding.
    pub fn is_idle(&self) -> bool {
        self.with_state(|state| state.pool.is_empty())
    }

    /// Aborts every outstanding job and dispatches the failure
    /// notifications synchronously.
    pub fn shutdown(&self) {
        let _guard = RemoveGuard::new(self, true);
        let mut index = 0;
        loop {
            let proceed = self.with_state(|state| {
                if index >= state.live.len() {
                    return false;
                }
                let slot = usize::from(state.live[index]);
                if let Some(transmitter) = state.pool.get_mut(slot) {
                    if !transmitter.handler().is_done() {
                        let result = transmitter.handler_mut().cancel(TransmitMessage::None);
                        self.handle_result(state, slot, result, "shutdown");
                    }
                }
                true
            });
            if !proceed {
                break;
            }
            index += 1;
        }
        self.flush_cancels();
    }

    /// Hands ready frames to the driver, alternating between jobs in
    /// round robin order so that no transfer can starve the others.
    fn send_next_frames(&self) {
        loop {
            let picked = self.with_state(|state| {
                if state.send_lock || state.pending_send || state.live.is_empty() {
                    return None;
                }
                if state.send_cursor >= state.live.len() {
                    state.send_cursor = 0;
                }
                let start = state.send_cursor;
                loop {
                    let slot = usize::from(state.live[state.send_cursor]);
                    if let Some(transmitter) = state.pool.get_mut(slot) {
                        if transmitter.handler().state() == TransmitState::Send
                            && transmitter.has_message()
                        {
                            state.send_lock = true;
                            // With a separation time in effect only one
                            // frame is sent per interval.
                            let block_end = if transmitter.min_separation_time_us() == 0 {
                                transmitter.handler().block_end()
                            } else {
                                transmitter.handler().frame_index() + 1
                            };
                            return Some(PendingSend::<DL> {
                                slot,
                                job: transmitter.job_handle(),
                                codec: transmitter.codec(),
                                transmission_address: transmitter.transmission_address(),
                                frame_index: transmitter.handler().frame_index(),
                                block_end,
                                consecutive_frame_data_size: transmitter
                                    .consecutive_frame_data_size(),
                                bytes_sent: transmitter.bytes_sent(),
                                message: transmitter.take_message().unwrap(),
                            });
                        }
                    }
                    state.send_cursor += 1;
                    if state.send_cursor >= state.live.len() {
                        state.send_cursor = 0;
                    }
                    if state.send_cursor == start {
                        return None;
                    }
                }
            });

            let Some(pending) = picked else {
                break;
            };

            let result = self.frame_transmitter.start_send_data_frames(
                pending.codec,
                self,
                pending.job,
                pending.transmission_address,
                pending.frame_index,
                pending.block_end,
                pending.consecutive_frame_data_size,
                &pending.message.payload()[pending.bytes_sent..],
            );

            let PendingSend { slot, message, .. } = pending;
            match result {
                SendResult::Queued | SendResult::QueuedFull => {
                    self.with_state(|state| {
                        state.pending_send = result == SendResult::QueuedFull;
                        if let Some(transmitter) = state.pool.get_mut(slot) {
                            transmitter.put_message(message);
                            let result = transmitter.handler_mut().frame_sending();
                            self.handle_result(state, slot, result, "send_next_frames");
                        }
                        if state.send_cursor < state.live.len() {
                            state.send_cursor += 1;
                        }
                        state.send_lock = false;
                    });
                    self.flush_cancels();
                    continue;
                }
                SendResult::Full => {
                    // Driver side congestion; keep the job in the send
                    // state and retry from the cyclic task.
                    self.with_state(|state| {
                        if let Some(transmitter) = state.pool.get_mut(slot) {
                            transmitter.put_message(message);
                        }
                        state.send_lock = false;
                    });
                    break;
                }
                SendResult::Failed => {
                    self.with_state(|state| {
                        if let Some(transmitter) = state.pool.get_mut(slot) {
                            transmitter.put_message(message);
                            let result =
                                transmitter.handler_mut().cancel(TransmitMessage::None);
                            self.handle_result(state, slot, result, "send_next_frames");
                        }
                        state.send_lock = false;
                    });
                    self.flush_cancels();
                    break;
                }
            }
        }
    }

    /// Common bookkeeping after a protocol handler transition: re-arm
    /// the job timer, queue done jobs for the sweep and log diagnostics.
    fn handle_result(
        &self,
        state: &mut TransmitterState<'p, 'm, DL, N>,
        slot: usize,
        result: TransmitResult,
        operation: &str,
    ) {
        if result.has_transition() {
            self.reset_timer(state, slot);
            if let Some(transmitter) = state.pool.get_mut(slot) {
                if transmitter.handler().is_done() {
                    if result.actions().contains(TransmitActions::CANCEL_SEND) {
                        state.pending_send = false;
                        state.pending_cancels.push(transmitter.job_handle()).ok();
                    }
                    transmitter.release();
                    debug_assert!(state.released_count != u8::MAX);
                    state.released_count += 1;
                    state.switch_context = true;
                } else {
                    state.timers_updated = true;
                }
            }
        }
        if result.message() != TransmitMessage::None {
            if let Some(transmitter) = state.pool.get(slot) {
                let source = transmitter.source_id();
                let target = transmitter.target_id();
                match result.message() {
                    TransmitMessage::IllegalState => dev_warn!(
                        "DoCanTransmitter({}): {}(0x{:x} -> 0x{:x}): illegal state {}",
                        self.bus_id,
                        operation,
                        source,
                        target,
                        result.param()
                    ),
                    TransmitMessage::TxCallbackTimeoutExpired => dev_warn!(
                        "DoCanTransmitter({}): {}(0x{:x} -> 0x{:x}): tx callback timeout",
                        self.bus_id,
                        operation,
                        source,
                        target
                    ),
                    TransmitMessage::FlowControlTimeoutExpired => dev_warn!(
                        "DoCanTransmitter({}): {}(0x{:x} -> 0x{:x}): flow control timeout",
                        self.bus_id,
                        operation,
                        source,
                        target
                    ),
                    TransmitMessage::FlowControlInvalid => dev_warn!(
                        "DoCanTransmitter({}): {}(0x{:x} -> 0x{:x}): invalid flow control received",
                        self.bus_id,
                        operation,
                        source,
                        target
                    ),
                    TransmitMessage::FlowControlOverflow => dev_warn!(
                        "DoCanTransmitter({}): {}(0x{:x} -> 0x{:x}): flow control overflow received",
                        self.bus_id,
                        operation,
                        source,
                        target
                    ),
                    TransmitMessage::FlowControlWaitCountExceeded => dev_warn!(
                        "DoCanTransmitter({}): {}(0x{:x} -> 0x{:x}): flow control wait count exceeded",
                        self.bus_id,
                        operation,
                        source,
                        target
                    ),
                    TransmitMessage::None => {}
                }
            }
        }
    }

    fn reset_timer(&self, state: &mut TransmitterState<'p, 'm, DL, N>, slot: usize) {
        let now_us = self.parameters.now_us();
        let TransmitterState {
            pool,
            sending_consecutive_frames_count,
            ..
        } = state;
        let Some(transmitter) = pool.get_mut(slot) else {
            return;
        };
        if transmitter.is_sending_consecutive_frames() {
            debug_assert!(*sending_consecutive_frames_count != 0);
            *sending_consecutive_frames_count =
                sending_consecutive_frames_count.saturating_sub(1);
        }
        match transmitter.handler().timeout() {
            TransmitTimeout::TxCallback => transmitter.set_timer(
                now_us.wrapping_add(self.parameters.wait_tx_callback_timeout_us()),
                false,
            ),
            TransmitTimeout::FlowControl => transmitter.set_timer(
                now_us.wrapping_add(self.parameters.wait_flow_control_timeout_us()),
                false,
            ),
            TransmitTimeout::SeparationTime => transmitter.set_timer(
                now_us.wrapping_add(transmitter.min_separation_time_us()),
                true,
            ),
            TransmitTimeout::None => transmitter.set_timer(now_us, false),
        }
        if transmitter.is_sending_consecutive_frames() {
            debug_assert!(*sending_consecutive_frames_count != u8::MAX);
            *sending_consecutive_frames_count += 1;
        }
    }

    /// Performs driver side cancels requested by handler transitions,
    /// outside of any critical section.
    fn flush_cancels(&self) {
        loop {
            let job = self.with_state(|state| state.pending_cancels.pop());
            let Some(job) = job else {
                break;
            };
            self.frame_transmitter.cancel_send_data_frames(self, job);
        }
    }

    fn set_remove_lock(&self) {
        self.with_state(|state| {
            debug_assert!(state.remove_lock_count != u8::MAX);
            state.remove_lock_count += 1;
        });
    }

    /// Counterpart of [`set_remove_lock`](Self::set_remove_lock). When
    /// the last lock holder leaves, done jobs are swept out of the live
    /// list and their listeners notified with no lock held.
    fn release_remove_lock(&self, remove: bool) {
        self.send_next_frames();
        let mut completions: Vec<Completion<'p, 'm>, N> = Vec::new();
        let switch_context = self.with_state(|state| {
            debug_assert!(state.remove_lock_count != 0);
            state.remove_lock_count -= 1;
            if remove && state.remove_lock_count == 0 && state.released_count > 0 {
                let mut index = 0;
                while index < state.live.len() && state.released_count > 0 {
                    let slot = usize::from(state.live[index]);
                    let done = state.pool.get(slot).is_some_and(|transmitter| {
                        transmitter.handler().is_done() && transmitter.has_message()
                    });
                    if !done {
                        index += 1;
                        continue;
                    }
                    if state.send_cursor == index {
                        state.pending_send = false;
                    } else if state.send_cursor > index {
                        state.send_cursor -= 1;
                    }
                    state.live.remove(index);
                    let transmitter = state.pool.release(slot).unwrap();
                    state.released_count -= 1;
                    completions.push(transmitter.into_completion()).ok();
                }
            }
            let switch_context = state.switch_context;
            state.switch_context = false;
            switch_context
        });
        for completion in completions {
            if let Some(listener) = completion.listener {
                listener.transport_message_processed(completion.message, completion.result);
            } else {
                dev_info!(
                    "DoCanTransmitter({}): job finished without notification listener",
                    self.bus_id
                );
            }
        }
        if switch_context {
            self.context.schedule();
        }
    }
}

impl<'p, 'm, DL: DataLinkLayer, const N: usize> DataFrameTransmitterCallback
    for DoCanTransmitter<'p, 'm, DL, N>
{
    fn data_frames_sent(&self, job: JobHandle, frame_count: u16, data_size: usize) {
        let _guard = RemoveGuard::new(self, false);
        let tick_needed = self.with_state(|state| {
            state.pending_send = false;
            if let Some(slot) = state.find_slot_by_job(job) {
                if let Some(transmitter) = state.pool.get_mut(slot) {
                    let result = transmitter.frames_sent(frame_count, data_size);
                    self.handle_result(state, slot, result, "data_frames_sent");
                }
                state.sending_consecutive_frames_count > 0
            } else {
                false
            }
        });
        self.flush_cancels();
        if tick_needed {
            self.tick_generator.tick_needed();
        }
    }
}

impl<'p, 'm, DL: DataLinkLayer> MessageTransmitter<'p, 'm, DL> {
    fn into_completion(mut self) -> Completion<'p, 'm> {
        let result = if self.handler().state() == TransmitState::Success {
            ProcessingResult::NoError
        } else {
            match self.handler().error_message() {
                TransmitMessage::FlowControlTimeoutExpired => ProcessingResult::ErrorTimeout,
                TransmitMessage::FlowControlOverflow => ProcessingResult::ErrorOverflow,
                TransmitMessage::FlowControlInvalid => ProcessingResult::ErrorAbort,
                _ => ProcessingResult::ErrorGeneral,
            }
        };
        Completion {
            message: self.take_message().unwrap(),
            listener: self.listener(),
            result,
        }
    }
}

/// Scope guard pairing the remove lock acquire/release around every
/// public entry point.
struct RemoveGuard<'g, 'p, 'm, DL: DataLinkLayer, const N: usize> {
    transmitter: &'g DoCanTransmitter<'p, 'm, DL, N>,
    remove: bool,
}

impl<'g, 'p, 'm, DL: DataLinkLayer, const N: usize> RemoveGuard<'g, 'p, 'm, DL, N> {
    fn new(transmitter: &'g DoCanTransmitter<'p, 'm, DL, N>, remove: bool) -> Self {
        transmitter.set_remove_lock();
        Self {
            transmitter,
            remove,
        }
    }
}

impl<'g, 'p, 'm, DL: DataLinkLayer, const N: usize> Drop for RemoveGuard<'g, 'p, 'm, DL, N> {
    fn drop(&mut self) {
        self.transmitter.release_remove_lock(self.remove);
    }
}

#[cfg(test)]
mod tests;

/*! Transport message model and the trait boundary towards the layer above
the transport protocol.

A [`TransportMessage`] wraps a buffer that is owned by the layer above; the
transport stack never allocates. The message travels *by value*: sending
moves it into the transport layer and completion moves it back out through
[`TransportMessageProcessedListener`], while on the receive side the
message provider hands one out by value and receives it back on release.
At any point in time exactly one party owns an in-flight message, which is
the invariant the reference counting tricks of comparable C and C++ stacks
only enforce by convention.
*/

#![no_std]

mod message;

pub use message::{BufferTooSmallError, TransportMessage};

/// Result of processing a transport message, reported back to the sender
/// of the message once the transfer has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingResult {
    NoError,
    ErrorTimeout,
    ErrorOverflow,
    ErrorAbort,
    ErrorGeneral,
    Error,
}

/// Errors returned by [`TransportMessageProvider::get_transport_message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderError {
    /// No message buffer is available right now; the caller may retry.
    NoMessageAvailable,
    /// The source id is not known to the provider.
    InvalidSourceId,
    /// The target id is not known to the provider.
    InvalidTargetId,
    /// No buffer of the requested size exists.
    SizeTooLarge,
    /// Any other, non-recoverable error.
    Error,
}

/// Error codes of the consumer facing `send` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportLayerError {
    /// The message cannot be routed or a conflicting transfer is running.
    SendFail,
    /// The message is not marked complete.
    MessageIncomplete,
    /// The message cannot be encoded (e.g. empty or too large).
    GeneralError,
    /// All send jobs are in use.
    QueueFull,
}

/// Listener that is notified once a transport message has been fully
/// processed. The message is handed back to the listener by value.
pub trait TransportMessageProcessedListener<'m> {
    fn transport_message_processed(&self, message: TransportMessage<'m>, result: ProcessingResult);
}

/// Supplier of message buffers for incoming transfers.
pub trait TransportMessageProvider<'m> {
    /// Requests a message able to hold `size` payload bytes for the given
    /// logical connection. `peek` exposes the already received initial
    /// payload so the provider can route on its content.
    fn get_transport_message(
        &self,
        bus_id: u8,
        source_id: u16,
        target_id: u16,
        size: usize,
        peek: &[u8],
    ) -> Result<TransportMessage<'m>, ProviderError>;

    /// Returns a previously supplied message to the provider.
    fn release_transport_message(&self, message: TransportMessage<'m>);
}

/// Listener for completely received transport messages.
pub trait TransportMessageListener<'m> {
    /// Delivers a received message together with the listener that must be
    /// notified once the upper layer has processed it. A rejected message
    /// is handed back through `Err` and will be released by the caller.
    fn message_received(
        &self,
        bus_id: u8,
        message: TransportMessage<'m>,
        processed_listener: Option<&dyn TransportMessageProcessedListener<'m>>,
    ) -> Result<(), TransportMessage<'m>>;
}

/// Combined provider/listener role of the layer above a transport
/// protocol's receive side.
pub trait TransportMessageProvidingListener<'m>:
    TransportMessageProvider<'m> + TransportMessageListener<'m>
{
}

impl<'m, T> TransportMessageProvidingListener<'m> for T where
    T: TransportMessageProvider<'m> + TransportMessageListener<'m>
{
}

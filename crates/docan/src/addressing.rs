//! Mapping between transport addresses and data link addresses.

use crate::datalink::{AddressPair, DataLinkLayer, FrameCodec};

/// The upper layer address pair of a transfer: diagnostic source and
/// target identifiers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportAddressPair {
    source: u16,
    target: u16,
}

impl TransportAddressPair {
    pub const fn new(source: u16, target: u16) -> Self {
        Self { source, target }
    }

    pub const fn source_id(self) -> u16 {
        self.source
    }

    pub const fn target_id(self) -> u16 {
        self.target
    }
}

/// A resolved logical connection: the codec and data link address pair of
/// one direction of transfer, together with the transport addresses it
/// belongs to.
pub struct Connection<'c, DL: DataLinkLayer> {
    codec: &'c FrameCodec,
    address_pair: AddressPair<DL::Address>,
    transport_pair: TransportAddressPair,
}

impl<'c, DL: DataLinkLayer> Connection<'c, DL> {
    pub fn new(
        codec: &'c FrameCodec,
        address_pair: AddressPair<DL::Address>,
        transport_pair: TransportAddressPair,
    ) -> Self {
        Self {
            codec,
            address_pair,
            transport_pair,
        }
    }

    pub fn codec(&self) -> &'c FrameCodec {
        self.codec
    }

    pub fn address_pair(&self) -> AddressPair<DL::Address> {
        self.address_pair
    }

    pub fn transport_pair(&self) -> TransportAddressPair {
        self.transport_pair
    }
}

/// Resolver of transport address pairs to data link parameters.
///
/// The resolver is the only component that knows the address mapping; the
/// transmitter consults it once per send job. The address table itself is
/// application configuration and injected from outside the protocol core.
pub trait AddressResolver<DL: DataLinkLayer> {
    /// Returns the data link address pair and codec for sending to the
    /// given transport pair, or `None` if no route exists.
    fn transmission_parameters(
        &self,
        transport_pair: TransportAddressPair,
    ) -> Option<(AddressPair<DL::Address>, &FrameCodec)>;
}

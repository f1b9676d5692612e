use std::future::Future;

use crate::signaling::SessionDescription;

/// A transport-agnostic reliable ordered byte channel.
///
/// The channel contract is the foundation the transfer protocol stands
/// on: bytes arrive exactly once, in order, and `read` returning `Ok(0)`
/// means the remote end closed its half. `write_all` resolves only once
/// the transport has accepted the bytes, which is what bounds outbound
/// memory — callers get backpressure for free by awaiting it.
pub trait ByteChannel: Send + 'static {
    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"127.0.0.1:54321"`).
    fn peer(&self) -> String;

    /// Reads bytes into `buf`, returning how many bytes were read.
    ///
    /// Returns `Ok(0)` when the remote end has closed the channel.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;

    /// Writes the entirety of `buf` to the channel.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half of the channel, signalling to the
    /// remote end that no more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// The offering side of a negotiation in flight.
///
/// Produced by [`ChannelFactory::create_offer`] together with the offer
/// description. Holds whatever the transport needs to keep listening
/// (an endpoint, a registration) until the remote answer arrives.
pub trait OfferedChannel: Send + 'static {
    type Channel: ByteChannel;

    /// Completes the negotiation with the remote answer: waits for the
    /// answering side to reach us and opens the channel. The offerer is
    /// always the side that opens the channel — the answerer only
    /// observes it appear.
    fn complete<'a>(
        self,
        answer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a;
}

/// The answering side of a negotiation in flight.
///
/// Produced by [`ChannelFactory::accept_offer`] together with the answer
/// description.
pub trait AnsweredChannel: Send + 'static {
    type Channel: ByteChannel;

    /// Waits for the channel the offerer opens.
    ///
    /// This resolves on an event delivered by the transport, not as a
    /// consequence of any local call — the answering side cannot force
    /// the channel into existence.
    fn wait_open(self) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send;
}

/// Factory for peer channels — the capability boundary around whatever
/// actually moves the bytes (QUIC, TCP, an in-process pipe).
///
/// Sessions and the engine are generic over this trait and never name a
/// concrete transport; tests plug in the in-memory factory.
pub trait ChannelFactory: Send + Sync + 'static {
    type Offering: OfferedChannel<Channel = Self::Channel>;
    type Answering: AnsweredChannel<Channel = Self::Channel>;
    type Channel: ByteChannel;

    /// Starts a negotiation as the initiating side: allocates whatever
    /// the transport needs to be reachable and describes it in the
    /// returned offer.
    fn create_offer(
        &self,
    ) -> impl Future<Output = anyhow::Result<(Self::Offering, SessionDescription)>> + Send + '_;

    /// Starts a negotiation as the responding side, bound to the given
    /// offer, and produces the answer to carry back out of band.
    fn accept_offer<'a>(
        &'a self,
        offer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<(Self::Answering, SessionDescription)>> + Send + 'a;
}

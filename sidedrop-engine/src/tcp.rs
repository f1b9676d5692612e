use anyhow::{Context, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use sidedrop_core::channel::{
    AnsweredChannel, ByteChannel, ChannelFactory, OfferedChannel,
};
use sidedrop_core::signaling::{DescriptionKind, SessionDescription};

const TRANSPORT: &str = "tcp";

/// Plaintext TCP channel factory.
///
/// The offer carries the listener address; the answering side dials it
/// when it starts waiting for the channel. No transport-level security —
/// use the QUIC factory for anything leaving the machine.
#[derive(Clone)]
pub struct TcpChannelFactory {
    bind_addr: String,
}

impl TcpChannelFactory {
    #[must_use]
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

impl Default for TcpChannelFactory {
    fn default() -> Self {
        Self::new("127.0.0.1:0")
    }
}

impl ChannelFactory for TcpChannelFactory {
    type Offering = TcpOffering;
    type Answering = TcpAnswering;
    type Channel = TcpChannel;

    fn create_offer(
        &self,
    ) -> impl Future<Output = anyhow::Result<(Self::Offering, SessionDescription)>> + Send + '_
    {
        async move {
            let listener = net::TcpListener::bind(&self.bind_addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {}", self.bind_addr))?;
            let local_addr = listener
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();

            info!(addr = %local_addr, "TCP offer listener bound");

            let offer = SessionDescription::offer(TRANSPORT, local_addr, None);
            Ok((TcpOffering { listener }, offer))
        }
    }

    fn accept_offer<'a>(
        &'a self,
        offer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<(Self::Answering, SessionDescription)>> + Send + 'a
    {
        async move {
            ensure!(
                offer.kind == DescriptionKind::Offer,
                "expected an offer description"
            );
            ensure!(
                offer.transport == TRANSPORT,
                "transport mismatch: expected {TRANSPORT}, got {}",
                offer.transport
            );
            let addr = offer
                .endpoint
                .as_deref()
                .context("offer is missing an endpoint")?
                .to_string();

            let answer = SessionDescription::answer(TRANSPORT);
            Ok((TcpAnswering { addr }, answer))
        }
    }
}

/// Offerer side of a pending TCP negotiation: a bound listener waiting
/// for the answering side to dial.
pub struct TcpOffering {
    listener: net::TcpListener,
}

impl OfferedChannel for TcpOffering {
    type Channel = TcpChannel;

    fn complete<'a>(
        self,
        _answer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a {
        async move {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            let peer_addr = addr.to_string();
            debug!(peer = %peer_addr, "Accepted TCP connection");
            Ok(TcpChannel { stream, peer_addr })
        }
    }
}

/// Answerer side of a pending TCP negotiation: the offerer's address,
/// dialled once the session starts waiting for the channel.
pub struct TcpAnswering {
    addr: String,
}

impl AnsweredChannel for TcpAnswering {
    type Channel = TcpChannel;

    fn wait_open(self) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send {
        async move {
            let stream = net::TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("failed to connect to {}", self.addr))?;
            let peer_addr = stream
                .peer_addr()
                .context("failed to retrieve peer address")?
                .to_string();
            debug!(peer = %peer_addr, "TCP connection established");
            Ok(TcpChannel { stream, peer_addr })
        }
    }
}

/// A TCP channel wrapping a [`tokio::net::TcpStream`].
pub struct TcpChannel {
    stream: net::TcpStream,
    peer_addr: String,
}

impl ByteChannel for TcpChannel {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TCP channel")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TCP channel")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP channel")
        }
    }
}

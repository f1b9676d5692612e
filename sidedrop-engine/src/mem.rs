use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use sidedrop_core::channel::{
    AnsweredChannel, ByteChannel, ChannelFactory, OfferedChannel,
};
use sidedrop_core::signaling::{DescriptionKind, SessionDescription};

/// Default duplex buffer size. This is the backpressure high-water mark:
/// a writer stalls once this many bytes sit unread in one direction.
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;

const TRANSPORT: &str = "mem";

/// A dial request: the answerer hands over a slot for the offerer to
/// drop the answerer's half of the channel into.
type DialRequest = oneshot::Sender<MemChannel>;

struct MemShared {
    endpoints: Mutex<HashMap<String, mpsc::Sender<DialRequest>>>,
    next_id: AtomicU64,
    high_water: usize,
}

/// In-process channel factory over bounded [`tokio::io::duplex`] pipes.
///
/// Both sides of a negotiation must hold clones of the same factory —
/// the endpoint table is the "network". Used by tests and the loopback
/// demo flow; the semantics (offerer opens the channel, answerer only
/// observes it) match the real transports.
#[derive(Clone)]
pub struct MemChannelFactory {
    shared: Arc<MemShared>,
}

impl Default for MemChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemChannelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    /// A factory whose channels buffer at most `high_water` bytes per
    /// direction before writers stall.
    #[must_use]
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            shared: Arc::new(MemShared {
                endpoints: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                high_water,
            }),
        }
    }
}

impl ChannelFactory for MemChannelFactory {
    type Offering = MemOffering;
    type Answering = MemAnswering;
    type Channel = MemChannel;

    fn create_offer(
        &self,
    ) -> impl Future<Output = anyhow::Result<(Self::Offering, SessionDescription)>> + Send + '_
    {
        async move {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            let endpoint = format!("mem:{id}");

            let (dial_tx, dial_rx) = mpsc::channel::<DialRequest>(1);
            self.shared
                .endpoints
                .lock()
                .expect("mem endpoint table lock poisoned")
                .insert(endpoint.clone(), dial_tx);

            debug!(endpoint = %endpoint, "Mem endpoint registered");

            let offer = SessionDescription::offer(TRANSPORT, endpoint.clone(), None);
            Ok((
                MemOffering {
                    endpoint,
                    dial_rx,
                    high_water: self.shared.high_water,
                },
                offer,
            ))
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
            let endpoint = offer
                .endpoint
                .as_deref()
                .context("offer is missing an endpoint")?;

            let dial_tx = {
                let endpoints = self
                    .shared
                    .endpoints
                    .lock()
                    .expect("mem endpoint table lock poisoned");
                endpoints.get(endpoint).cloned()
            };
            let Some(dial_tx) = dial_tx else {
                bail!("unknown mem endpoint: {endpoint}");
            };

            // Dial immediately; the offerer picks the request up whenever
            // it completes the negotiation.
            let (chan_tx, chan_rx) = oneshot::channel();
            dial_tx
                .send(chan_tx)
                .await
                .map_err(|_| anyhow::anyhow!("mem endpoint {endpoint} no longer listening"))?;

            let answer = SessionDescription::answer(TRANSPORT);
            Ok((MemAnswering { chan_rx }, answer))
        }
    }
}

/// Offerer side of a pending mem negotiation.
pub struct MemOffering {
    endpoint: String,
    dial_rx: mpsc::Receiver<DialRequest>,
    high_water: usize,
}

impl OfferedChannel for MemOffering {
    type Channel = MemChannel;

    fn complete<'a>(
        mut self,
        _answer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a {
        async move {
            let request = self
                .dial_rx
                .recv()
                .await
                .context("mem negotiation abandoned before any dial")?;

            let (offerer_half, answerer_half) = tokio::io::duplex(self.high_water);

            let answerer = MemChannel {
                stream: answerer_half,
                peer: format!("{}/offerer", self.endpoint),
            };
            request
                .send(answerer)
                .map_err(|_| anyhow::anyhow!("mem dialer went away before channel open"))?;

            Ok(MemChannel {
                stream: offerer_half,
                peer: format!("{}/answerer", self.endpoint),
            })
        }
    }
}

/// Answerer side of a pending mem negotiation.
pub struct MemAnswering {
    chan_rx: oneshot::Receiver<MemChannel>,
}

impl AnsweredChannel for MemAnswering {
    type Channel = MemChannel;

    fn wait_open(self) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send {
        async move {
            self.chan_rx
                .await
                .context("mem offerer went away before opening the channel")
        }
    }
}

/// One half of an in-process channel.
pub struct MemChannel {
    stream: DuplexStream,
    peer: String,
}

impl ByteChannel for MemChannel {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from mem channel")
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
                .context("failed to write to mem channel")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down mem channel")
        }
    }
}

/// A directly connected channel pair, bypassing negotiation. Handy for
/// exercising the transfer protocol in isolation.
#[must_use]
pub fn channel_pair(high_water: usize) -> (MemChannel, MemChannel) {
    let (a, b) = tokio::io::duplex(high_water);
    (
        MemChannel {
            stream: a,
            peer: "mem:pair/b".into(),
        },
        MemChannel {
            stream: b,
            peer: "mem:pair/a".into(),
        },
    )
}

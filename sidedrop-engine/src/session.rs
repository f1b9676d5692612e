use std::time::Duration;

use anyhow::{Context, anyhow, ensure};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use sidedrop_core::channel::{AnsweredChannel, ByteChannel, ChannelFactory, OfferedChannel};
use sidedrop_core::protocol::{self, BindPayload, MessageType};
use sidedrop_core::signaling::{DescriptionKind, SessionDescription};

use crate::framed::FramedChannel;

/// Ceiling on the whole connect wait: completing the negotiation with the
/// transport, the channel becoming visible, and the bind handshake.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Which end of the hand-off this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Lifecycle of one session. States only ever advance — no state is
/// revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Negotiating => 1,
            Self::Connected => 2,
            Self::Closed | Self::Failed => 3,
        }
    }
}

/// Errors from driving a session's negotiation lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is defined, but not from the session's current state.
    #[error("{op} is invalid in state {state:?}")]
    InvalidStateTransition {
        op: &'static str,
        state: SessionState,
    },

    /// The session already reached a terminal state; start a new one.
    #[error("session already terminated (state {state:?})")]
    SessionTerminated { state: SessionState },

    /// The channel never became usable within the configured ceiling.
    #[error("negotiation timed out after {timeout:?}")]
    NegotiationTimeout { timeout: Duration },

    /// The transport reported a negotiation failure.
    #[error("negotiation failed")]
    Negotiation(#[source] anyhow::Error),
}

/// Knobs shared by both session roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub negotiation_timeout: Duration,
    /// Size of one outbound file chunk.
    pub chunk_size: usize,
    /// Close the session once a transfer completes.
    pub close_on_complete: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            chunk_size: protocol::DEFAULT_CHUNK_SIZE,
            close_on_complete: true,
        }
    }
}

/// The monotonic state cell shared by both session variants.
#[derive(Debug)]
struct StateCell {
    state: SessionState,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    fn get(&self) -> SessionState {
        self.state
    }

    /// Guards an operation that is only legal in `expected`: terminal
    /// states report `SessionTerminated`, everything else reports
    /// `InvalidStateTransition`.
    fn require(&self, expected: SessionState, op: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else if self.state.is_terminal() {
            Err(SessionError::SessionTerminated { state: self.state })
        } else {
            Err(SessionError::InvalidStateTransition {
                op,
                state: self.state,
            })
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            next.rank() > self.state.rank(),
            "state must advance monotonically ({:?} -> {next:?})",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "Session state advanced");
        self.state = next;
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.advance(SessionState::Failed);
        }
    }
}

/// Common surface of the two session variants, as seen by the transfer
/// protocol and the engine.
pub trait Session: Send {
    type Channel: ByteChannel;

    fn role(&self) -> Role;
    fn state(&self) -> SessionState;
    fn config(&self) -> &SessionConfig;

    /// The connected channel, if the session has one.
    fn framed(&self) -> Option<&FramedChannel<Self::Channel>>;
    fn framed_mut(&mut self) -> Option<&mut FramedChannel<Self::Channel>>;

    /// Drives the session to `Failed` unless already terminal.
    fn mark_failed(&mut self);

    /// Remote peer identifier, once connected.
    fn peer(&self) -> Option<String> {
        self.framed().map(FramedChannel::peer)
    }
}

// ── Sender ──────────────────────────────────────────────────────────

/// The initiating session: creates the offer, later accepts the answer.
///
/// The sender is also the side that opens the data channel — the
/// receiver only observes it appear. That asymmetry is why
/// [`accept_answer`](SenderSession::accept_answer) waits on the
/// transport's own readiness rather than treating its local call as
/// proof of connection.
pub struct SenderSession<F: ChannelFactory> {
    state: StateCell,
    config: SessionConfig,
    offering: Option<F::Offering>,
    local: Option<SessionDescription>,
    channel: Option<FramedChannel<F::Channel>>,
}

impl<F: ChannelFactory> SenderSession<F> {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: StateCell::new(),
            config,
            offering: None,
            local: None,
            channel: None,
        }
    }

    /// Local offer description, once created.
    #[must_use]
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    /// Constructs the local offer and moves to `Negotiating`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition`/`SessionTerminated` outside `Idle`;
    /// `Negotiation` if the transport cannot allocate an endpoint.
    pub async fn create_offer(&mut self, factory: &F) -> Result<SessionDescription, SessionError> {
        self.state.require(SessionState::Idle, "create_offer")?;
        self.state.advance(SessionState::Negotiating);

        match factory.create_offer().await {
            Ok((offering, offer)) => {
                self.offering = Some(offering);
                self.local = Some(offer.clone());
                info!(transport = %offer.transport, "Offer created");
                Ok(offer)
            }
            Err(e) => {
                self.state.fail();
                Err(SessionError::Negotiation(e))
            }
        }
    }

    /// Accepts the remote answer and waits — bounded by the negotiation
    /// timeout — for the channel to open and bind. On success the
    /// session is `Connected`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition`/`SessionTerminated` outside
    /// `Negotiating`; `NegotiationTimeout` if the ceiling expires;
    /// `Negotiation` on transport or bind failure. All three failure
    /// paths leave the session `Failed`.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        self.state.require(SessionState::Negotiating, "accept_answer")?;

        if answer.kind != DescriptionKind::Answer {
            self.state.fail();
            return Err(SessionError::Negotiation(anyhow!(
                "expected an answer description, got {:?}",
                answer.kind
            )));
        }

        let offering = self
            .offering
            .take()
            .expect("offering present while negotiating");

        let connect = async {
            let channel = offering.complete(&answer).await?;
            let mut framed = FramedChannel::new(channel);
            bind_as_offerer(&mut framed, &answer.token).await?;
            Ok::<_, anyhow::Error>(framed)
        };

        match timeout(self.config.negotiation_timeout, connect).await {
            Ok(Ok(framed)) => {
                info!(peer = %framed.peer(), "Session connected");
                self.channel = Some(framed);
                self.state.advance(SessionState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Negotiation failed");
                self.state.fail();
                Err(SessionError::Negotiation(e))
            }
            Err(_) => {
                warn!(timeout = ?self.config.negotiation_timeout, "Negotiation timed out");
                self.state.fail();
                Err(SessionError::NegotiationTimeout {
                    timeout: self.config.negotiation_timeout,
                })
            }
        }
    }

    /// Closes the session from any non-terminal state.
    ///
    /// # Errors
    ///
    /// `SessionTerminated` if the session is already closed or failed.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        close_impl(&mut self.state, &mut self.channel).await
    }
}

impl<F: ChannelFactory> Session for SenderSession<F> {
    type Channel = F::Channel;

    fn role(&self) -> Role {
        Role::Sender
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn framed(&self) -> Option<&FramedChannel<Self::Channel>> {
        self.channel.as_ref()
    }

    fn framed_mut(&mut self) -> Option<&mut FramedChannel<Self::Channel>> {
        self.channel.as_mut()
    }

    fn mark_failed(&mut self) {
        self.state.fail();
    }
}

// ── Receiver ────────────────────────────────────────────────────────

/// The responding session: accepts an offer, produces the answer, then
/// waits for the sender to open the channel.
pub struct ReceiverSession<F: ChannelFactory> {
    state: StateCell,
    config: SessionConfig,
    answering: Option<F::Answering>,
    local: Option<SessionDescription>,
    channel: Option<FramedChannel<F::Channel>>,
}

impl<F: ChannelFactory> ReceiverSession<F> {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: StateCell::new(),
            config,
            answering: None,
            local: None,
            channel: None,
        }
    }

    /// Local answer description, once created.
    #[must_use]
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    /// Binds to the given offer, constructs the answer to carry back to
    /// the sender, and moves to `Negotiating`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition`/`SessionTerminated` outside `Idle`;
    /// `Negotiation` if the description is not an offer or the transport
    /// rejects it.
    pub async fn accept_offer(
        &mut self,
        factory: &F,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        self.state.require(SessionState::Idle, "accept_offer")?;
        self.state.advance(SessionState::Negotiating);

        if offer.kind != DescriptionKind::Offer {
            self.state.fail();
            return Err(SessionError::Negotiation(anyhow!(
                "expected an offer description, got {:?}",
                offer.kind
            )));
        }

        match factory.accept_offer(&offer).await {
            Ok((answering, answer)) => {
                self.answering = Some(answering);
                self.local = Some(answer.clone());
                info!(transport = %answer.transport, "Answer created");
                Ok(answer)
            }
            Err(e) => {
                self.state.fail();
                Err(SessionError::Negotiation(e))
            }
        }
    }

    /// Waits — bounded by the negotiation timeout — for the sender to
    /// open the channel, then verifies the bind token and confirms. On
    /// success the session is `Connected`.
    ///
    /// The transition here is driven by the transport's inbound-channel
    /// event: the receiver cannot force it, only await it.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition`/`SessionTerminated` outside
    /// `Negotiating`; `NegotiationTimeout` or `Negotiation` on failure,
    /// both leaving the session `Failed`.
    pub async fn wait_connected(&mut self) -> Result<(), SessionError> {
        self.state.require(SessionState::Negotiating, "wait_connected")?;

        let answering = self
            .answering
            .take()
            .expect("answering present while negotiating");
        let token = self
            .local
            .as_ref()
            .expect("answer present while negotiating")
            .token
            .clone();

        let connect = async {
            let channel = answering.wait_open().await?;
            let mut framed = FramedChannel::new(channel);
            bind_as_answerer(&mut framed, &token).await?;
            Ok::<_, anyhow::Error>(framed)
        };

        match timeout(self.config.negotiation_timeout, connect).await {
            Ok(Ok(framed)) => {
                info!(peer = %framed.peer(), "Session connected");
                self.channel = Some(framed);
                self.state.advance(SessionState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Negotiation failed");
                self.state.fail();
                Err(SessionError::Negotiation(e))
            }
            Err(_) => {
                warn!(timeout = ?self.config.negotiation_timeout, "Negotiation timed out");
                self.state.fail();
                Err(SessionError::NegotiationTimeout {
                    timeout: self.config.negotiation_timeout,
                })
            }
        }
    }

    /// Closes the session from any non-terminal state.
    ///
    /// # Errors
    ///
    /// `SessionTerminated` if the session is already closed or failed.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        close_impl(&mut self.state, &mut self.channel).await
    }
}

impl<F: ChannelFactory> Session for ReceiverSession<F> {
    type Channel = F::Channel;

    fn role(&self) -> Role {
        Role::Receiver
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn framed(&self) -> Option<&FramedChannel<Self::Channel>> {
        self.channel.as_ref()
    }

    fn framed_mut(&mut self) -> Option<&mut FramedChannel<Self::Channel>> {
        self.channel.as_mut()
    }

    fn mark_failed(&mut self) {
        self.state.fail();
    }
}

async fn close_impl<C: ByteChannel>(
    state: &mut StateCell,
    channel: &mut Option<FramedChannel<C>>,
) -> Result<(), SessionError> {
    if state.get().is_terminal() {
        return Err(SessionError::SessionTerminated { state: state.get() });
    }
    if let Some(framed) = channel.as_mut() {
        // Best effort: the remote end may already be gone.
        if let Err(e) = framed.shutdown().await {
            debug!(error = %e, "Shutdown on close failed");
        }
    }
    *channel = None;
    state.advance(SessionState::Closed);
    Ok(())
}

// ── Channel-bind handshake ──────────────────────────────────────────
//
// Run immediately after the transport reports the channel open. The
// offerer proves it holds the answer by echoing the answer's token; the
// answerer confirms with an ack. Only after the round-trip does either
// side consider the session connected.

async fn bind_as_offerer<C: ByteChannel>(
    framed: &mut FramedChannel<C>,
    answer_token: &str,
) -> anyhow::Result<()> {
    framed
        .send_payload(
            MessageType::Bind,
            &BindPayload {
                token: answer_token.to_string(),
            },
        )
        .await
        .context("failed to send channel bind")?;

    let frame = framed
        .recv()
        .await
        .context("failed to read bind ack")?
        .context("channel closed before bind ack")?;
    ensure!(
        frame.header.msg_type == MessageType::BindAck,
        "expected BIND_ACK, got {:?}",
        frame.header.msg_type
    );
    debug!("Channel bind acknowledged");
    Ok(())
}

async fn bind_as_answerer<C: ByteChannel>(
    framed: &mut FramedChannel<C>,
    expected_token: &str,
) -> anyhow::Result<()> {
    let frame = framed
        .recv()
        .await
        .context("failed to read channel bind")?
        .context("channel closed before bind")?;
    ensure!(
        frame.header.msg_type == MessageType::Bind,
        "expected BIND, got {:?}",
        frame.header.msg_type
    );

    let payload: BindPayload =
        protocol::decode_payload(&frame.payload).context("invalid bind payload")?;
    ensure!(
        payload.token == expected_token,
        "channel bind token mismatch"
    );

    framed
        .send(MessageType::BindAck, &[])
        .await
        .context("failed to send bind ack")?;
    debug!("Channel bind verified");
    Ok(())
}

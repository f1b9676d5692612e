use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use sidedrop_core::channel::ChannelFactory;
use sidedrop_core::registry::{DEFAULT_OFFER_TTL, OfferRegistry};
use sidedrop_core::signaling::{self, SessionDescription};

use crate::session::{ReceiverSession, Role, SenderSession, Session, SessionConfig};
use crate::transfer::{self, TransferError};

// ── Engine commands (UI → engine) ───────────────────────────────────

/// Commands sent by the CLI / UI to control the engine.
#[derive(Clone, Debug)]
pub enum EngineCmd {
    /// Start a sender session: create an offer, store it in the registry,
    /// and report the code and armored text to share.
    CreateOffer,
    /// Start a receiver session from a registry code.
    AcceptCode { code: String },
    /// Start a receiver session from pasted armored offer text.
    AcceptOffer { encoded: String },
    /// Send a command to a specific session identified by its ID.
    SessionCmd { session_id: u64, cmd: SessionCmd },
    /// Gracefully shut down the entire engine.
    ShutDown,
}

/// Commands routed to one session.
#[derive(Clone, Debug)]
pub enum SessionCmd {
    /// Deliver the pasted armored answer to a sender session.
    AcceptAnswer { encoded: String },
    /// Send the file at `path` over a connected sender session.
    SendFile { path: PathBuf },
    /// Close the session.
    Close,
}

// ── Engine events (engine → UI) ─────────────────────────────────────

/// Events emitted by the engine for the CLI / UI to observe.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A new session was created.
    SessionCreated { session_id: u64, role: Role },
    /// A session-level event, tagged with the session ID so the UI can
    /// route it to the right view.
    SessionEvent {
        session_id: u64,
        event: SessionEvent,
    },
    /// A non-fatal error occurred inside the engine.
    Error { message: String },
}

/// Events emitted by one session.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The offer exists: share the code (same-process lookup) or the
    /// armored text (manual exchange) with the receiving party.
    OfferReady { code: String, encoded: String },
    /// The answer exists: carry the armored text back to the sender.
    AnswerReady { encoded: String },
    /// Negotiation finished; the channel is open and bound.
    Connected { peer: String },
    /// Outbound transfer finished.
    TransferComplete { bytes_sent: u64 },
    /// Inbound transfer finished and the artifact is on disk.
    TransferReceived {
        file_name: String,
        size_bytes: u64,
        stored_path: PathBuf,
    },
    /// A non-fatal session error (bad paste, unreadable file, …).
    /// The session is still usable.
    Error { message: String },
    /// The session failed; start a new one.
    Failed { reason: String },
    /// The session closed.
    Closed,
    /// Terminal marker: no more events will follow.
    Finished,
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle returned by [`Engine::start`].  Lets the caller send commands
/// and subscribe to events.
pub struct EngineHandle {
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub events_tx: broadcast::Sender<EngineEvent>,
}

// ── Engine ──────────────────────────────────────────────────────────

/// Configuration shared by all sessions created by the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory where received files are stored.
    pub receive_dir: PathBuf,
    /// Per-session knobs (timeout, chunk size, close-on-complete).
    pub session: SessionConfig,
    /// How long stored offers stay claimable by code.
    pub offer_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            receive_dir: PathBuf::from("/tmp/sidedrop"),
            session: SessionConfig::default(),
            offer_ttl: DEFAULT_OFFER_TTL,
        }
    }
}

/// The sidedrop engine.
///
/// Owns the offer registry — the only state shared across sessions —
/// and spawns one task per session. Each task owns its session
/// exclusively and reports through a per-session event channel; the
/// engine re-publishes those events on one broadcast bus, tagged with
/// the session ID.
///
/// The engine is generic over the [`ChannelFactory`], so the same loop
/// drives QUIC, TCP, or in-memory channels.
pub struct Engine;

impl Engine {
    /// Spawn the engine event loop and return a handle to control it.
    ///
    /// The engine starts idle — no sessions exist until commands arrive.
    pub fn start<F: ChannelFactory>(self, factory: F, config: EngineConfig) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(32);
        let (events_tx, _) = broadcast::channel::<EngineEvent>(128);

        let events = events_tx.clone();

        info!("Spawning engine event loop");

        tokio::spawn(run_engine_loop(Arc::new(factory), config, cmd_rx, events));

        debug!("Engine started successfully");
        EngineHandle { cmd_tx, events_tx }
    }
}

/// Internal bookkeeping for a spawned session.
struct ActiveSession {
    cmd_tx: mpsc::Sender<SessionCmd>,
}

/// The main engine event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Engine` itself.
async fn run_engine_loop<F: ChannelFactory>(
    factory: Arc<F>,
    config: EngineConfig,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
    events: broadcast::Sender<EngineEvent>,
) {
    debug!("Engine event loop running");

    let registry = Arc::new(OfferRegistry::new(config.offer_ttl));
    let mut next_session_id: u64 = 1;
    let mut sessions: Vec<(u64, ActiveSession)> = Vec::new();

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            EngineCmd::CreateOffer => {
                let sid = next_session_id;
                next_session_id += 1;

                info!(session_id = sid, "Creating sender session");
                let _ = events.send(EngineEvent::SessionCreated {
                    session_id: sid,
                    role: Role::Sender,
                });

                let (session_cmd_tx, session_cmd_rx) = mpsc::channel::<SessionCmd>(8);
                let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(32);

                tokio::spawn(run_sender_session(
                    factory.clone(),
                    registry.clone(),
                    config.session.clone(),
                    session_cmd_rx,
                    event_tx,
                ));
                spawn_event_forwarder(sid, event_rx, events.clone());

                sessions.push((
                    sid,
                    ActiveSession {
                        cmd_tx: session_cmd_tx,
                    },
                ));
            }

            EngineCmd::AcceptCode { code } => match registry.lookup(&code) {
                Ok(offer) => {
                    let sid = next_session_id;
                    next_session_id += 1;
                    spawn_receiver(sid, &factory, &config, offer, &events, &mut sessions);
                }
                Err(e) => {
                    warn!(code = %code, error = %e, "Code lookup failed");
                    let _ = events.send(EngineEvent::Error {
                        message: e.to_string(),
                    });
                }
            },

            EngineCmd::AcceptOffer { encoded } => match signaling::decode(&encoded) {
                Ok(offer) => {
                    let sid = next_session_id;
                    next_session_id += 1;
                    spawn_receiver(sid, &factory, &config, offer, &events, &mut sessions);
                }
                Err(e) => {
                    warn!(error = %e, "Offer decode failed");
                    let _ = events.send(EngineEvent::Error {
                        message: e.to_string(),
                    });
                }
            },

            EngineCmd::SessionCmd { session_id, cmd } => {
                if let Some((_, session)) = sessions.iter().find(|(id, _)| *id == session_id) {
                    if let Err(e) = session.cmd_tx.send(cmd).await {
                        warn!(
                            session_id = session_id,
                            error = %e,
                            "Failed to forward command to session"
                        );
                    }
                } else {
                    warn!(session_id = session_id, "Session not found");
                    let _ = events.send(EngineEvent::Error {
                        message: format!("no session #{session_id}"),
                    });
                }
            }

            EngineCmd::ShutDown => {
                info!("Received ShutDown command");
                for (id, session) in &sessions {
                    debug!(session_id = id, "Closing session");
                    let _ = session.cmd_tx.send(SessionCmd::Close).await;
                }
                break;
            }
        }
    }

    info!("Engine event loop stopped");
}

fn spawn_receiver<F: ChannelFactory>(
    sid: u64,
    factory: &Arc<F>,
    config: &EngineConfig,
    offer: SessionDescription,
    events: &broadcast::Sender<EngineEvent>,
    sessions: &mut Vec<(u64, ActiveSession)>,
) {
    info!(session_id = sid, "Creating receiver session");
    let _ = events.send(EngineEvent::SessionCreated {
        session_id: sid,
        role: Role::Receiver,
    });

    let (session_cmd_tx, session_cmd_rx) = mpsc::channel::<SessionCmd>(8);
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(32);

    tokio::spawn(run_receiver_session(
        factory.clone(),
        config.session.clone(),
        config.receive_dir.clone(),
        offer,
        session_cmd_rx,
        event_tx,
    ));
    spawn_event_forwarder(sid, event_rx, events.clone());

    sessions.push((
        sid,
        ActiveSession {
            cmd_tx: session_cmd_tx,
        },
    ));
}

/// Spawns a background task that reads [`SessionEvent`]s from a session
/// and re-publishes them as [`EngineEvent::SessionEvent`]s on the engine
/// broadcast channel, tagged with the session ID.
fn spawn_event_forwarder(
    session_id: u64,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    events_tx: broadcast::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            let is_finished = matches!(ev, SessionEvent::Finished);
            let _ = events_tx.send(EngineEvent::SessionEvent {
                session_id,
                event: ev,
            });
            if is_finished {
                break;
            }
        }
        debug!(session_id = session_id, "Session event forwarder stopped");
    });
}

// ── Session tasks ───────────────────────────────────────────────────

async fn run_sender_session<F: ChannelFactory>(
    factory: Arc<F>,
    registry: Arc<OfferRegistry>,
    config: SessionConfig,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut session = SenderSession::<F>::new(config.clone());

    let offer = match session.create_offer(factory.as_ref()).await {
        Ok(offer) => offer,
        Err(e) => {
            let _ = events
                .send(SessionEvent::Failed {
                    reason: e.to_string(),
                })
                .await;
            let _ = events.send(SessionEvent::Finished).await;
            return;
        }
    };

    let ready = signaling::encode(&offer)
        .map_err(anyhow::Error::from)
        .and_then(|encoded| {
            let code = registry.store(offer)?;
            Ok((code, encoded))
        });
    match ready {
        Ok((code, encoded)) => {
            let _ = events
                .send(SessionEvent::OfferReady { code, encoded })
                .await;
        }
        Err(e) => {
            let _ = events
                .send(SessionEvent::Failed {
                    reason: e.to_string(),
                })
                .await;
            let _ = events.send(SessionEvent::Finished).await;
            return;
        }
    }

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SessionCmd::AcceptAnswer { encoded } => {
                let answer = match signaling::decode(&encoded) {
                    Ok(answer) => answer,
                    Err(e) => {
                        let _ = events
                            .send(SessionEvent::Error {
                                message: format!("invalid answer: {e}"),
                            })
                            .await;
                        continue;
                    }
                };
                match session.accept_answer(answer).await {
                    Ok(()) => {
                        let peer = session.peer().unwrap_or_default();
                        let _ = events.send(SessionEvent::Connected { peer }).await;
                    }
                    Err(e) => {
                        let _ = events
                            .send(SessionEvent::Failed {
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }

            SessionCmd::SendFile { path } => {
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = events
                            .send(SessionEvent::Error {
                                message: format!("cannot read {}: {e}", path.display()),
                            })
                            .await;
                        continue;
                    }
                };
                let file_name = path
                    .file_name()
                    .map_or_else(|| "unnamed".into(), |n| n.to_string_lossy().to_string());

                match transfer::send_file(&mut session, &bytes, &file_name).await {
                    Ok(bytes_sent) => {
                        let _ = events
                            .send(SessionEvent::TransferComplete { bytes_sent })
                            .await;
                        if config.close_on_complete {
                            let _ = session.close().await;
                            let _ = events.send(SessionEvent::Closed).await;
                            break;
                        }
                    }
                    Err(TransferError::NotConnected) => {
                        let _ = events
                            .send(SessionEvent::Error {
                                message: "session is not connected yet".into(),
                            })
                            .await;
                    }
                    Err(e) => {
                        let _ = events
                            .send(SessionEvent::Failed {
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }

            SessionCmd::Close => {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Close on terminal session");
                }
                let _ = events.send(SessionEvent::Closed).await;
                break;
            }
        }
    }

    let _ = events.send(SessionEvent::Finished).await;
}

async fn run_receiver_session<F: ChannelFactory>(
    factory: Arc<F>,
    config: SessionConfig,
    receive_dir: PathBuf,
    offer: SessionDescription,
    _cmd_rx: mpsc::Receiver<SessionCmd>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut session = ReceiverSession::<F>::new(config.clone());

    let answer = match session.accept_offer(factory.as_ref(), offer).await {
        Ok(answer) => answer,
        Err(e) => {
            let _ = events
                .send(SessionEvent::Failed {
                    reason: e.to_string(),
                })
                .await;
            let _ = events.send(SessionEvent::Finished).await;
            return;
        }
    };

    match signaling::encode(&answer) {
        Ok(encoded) => {
            let _ = events.send(SessionEvent::AnswerReady { encoded }).await;
        }
        Err(e) => {
            let _ = events
                .send(SessionEvent::Failed {
                    reason: e.to_string(),
                })
                .await;
            let _ = events.send(SessionEvent::Finished).await;
            return;
        }
    }

    // From here the session is driven entirely by the transport: the
    // sender opens the channel, then streams the file.
    if let Err(e) = session.wait_connected().await {
        let _ = events
            .send(SessionEvent::Failed {
                reason: e.to_string(),
            })
            .await;
        let _ = events.send(SessionEvent::Finished).await;
        return;
    }
    let peer = session.peer().unwrap_or_default();
    let _ = events.send(SessionEvent::Connected { peer }).await;

    match transfer::receive_file(&mut session).await {
        Ok(file) => {
            match sidedrop_core::fs::write_received(&receive_dir, &file.file_name, &file.bytes)
                .await
            {
                Ok(stored_path) => {
                    let _ = events
                        .send(SessionEvent::TransferReceived {
                            file_name: file.file_name,
                            size_bytes: file.bytes.len() as u64,
                            stored_path,
                        })
                        .await;
                    if config.close_on_complete {
                        let _ = session.close().await;
                        let _ = events.send(SessionEvent::Closed).await;
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(SessionEvent::Failed {
                            reason: format!("failed to store artifact: {e}"),
                        })
                        .await;
                }
            }
        }
        Err(e) => {
            let _ = events
                .send(SessionEvent::Failed {
                    reason: e.to_string(),
                })
                .await;
        }
    }

    let _ = events.send(SessionEvent::Finished).await;
}

// ── Tests ───────────────────────────────────────────────────────────

//! Core e2e framework: an initiator and a responder engine joined by TCP

use anyhow::{anyhow, Context, Result};
use codec::{encode_into, MessageRegistry, Ping, Pong, WireMessage};
use crossbeam_channel::{unbounded, Receiver, Sender};
use engine::{
    EngineConfig, MessagingEngine, ReceivedMessage, SessionHandler, SessionId, TcpFacility,
};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const INITIATOR_PEER: &str = "initiator";
pub const RESPONDER_PEER: &str = "responder";

/// A pong as seen by the initiator
#[derive(Debug, Clone, Copy)]
pub struct PongEvent {
    pub pong: Pong,
    pub received_at: Instant,
}

/// Encode `message` straight into the session's send segment
fn send_message<M: WireMessage>(
    engine: &engine::EngineHandle,
    session: SessionId,
    message: &M,
) -> engine::Result<()> {
    engine.send_with(session, message.encoded_len(), |body| {
        encode_into(message, body).unwrap_or(0)
    })
}

/// Answers every ping with a pong carrying its id
struct Responder {
    registry: MessageRegistry,
    closed: Sender<SessionId>,
}

impl SessionHandler for Responder {
    fn on_message(&self, message: &ReceivedMessage<'_>) {
        let decoded = match self.registry.decode(message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(session_id = message.session_id, error = %e, "Undecodable payload, closing session");
                message.engine.close_session(message.session_id);
                return;
            }
        };
        if let Some(ping) = decoded.downcast_ref::<Ping>() {
            let pong = Pong { ping_id: ping.id };
            if let Err(e) = send_message(message.engine, message.session_id, &pong) {
                warn!(ping_id = ping.id, error = %e, "Failed to answer ping");
            }
        }
    }

    fn on_closed(&self, session_id: SessionId, peer_id: Option<&str>) {
        debug!(session_id, peer = ?peer_id, "Responder session closed");
        let _ = self.closed.send(session_id);
    }
}

/// Forwards pongs to the test thread
struct Initiator {
    registry: MessageRegistry,
    pongs: Sender<PongEvent>,
    closed: Sender<SessionId>,
}

impl SessionHandler for Initiator {
    fn on_message(&self, message: &ReceivedMessage<'_>) {
        match self.registry.decode_as::<Pong>(message.payload) {
            Ok(pong) => {
                let _ = self.pongs.send(PongEvent {
                    pong,
                    received_at: Instant::now(),
                });
            }
            Err(e) => {
                warn!(session_id = message.session_id, error = %e, "Unexpected payload, closing session");
                message.engine.close_session(message.session_id);
            }
        }
    }

    fn on_closed(&self, session_id: SessionId, _peer_id: Option<&str>) {
        let _ = self.closed.send(session_id);
    }
}

/// One engine with its TCP facility
pub struct Node {
    pub engine: MessagingEngine,
    pub facility: Arc<TcpFacility>,
    pub session: SessionId,
}

impl Node {
    fn start(
        config: EngineConfig,
        handler: Arc<dyn SessionHandler>,
        stream: TcpStream,
        peer: &str,
    ) -> Result<Self> {
        let facility = Arc::new(TcpFacility::new());
        let engine = MessagingEngine::start(config, facility.clone(), handler)
            .context("Failed to start engine")?;
        let socket = facility.adopt(stream)?;
        let session = engine.acquire_session()?;
        engine.open_session(session, socket)?;
        engine.bind_peer(session, peer)?;
        Ok(Self {
            engine,
            facility,
            session,
        })
    }
}

pub struct PingPongPair {
    pub initiator: Node,
    pub responder: Node,
    pongs: Receiver<PongEvent>,
    initiator_closed: Receiver<SessionId>,
    responder_closed: Receiver<SessionId>,
}

impl PingPongPair {
    /// Start both engines and connect them over localhost
    pub fn connect(config: EngineConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind listener")?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).context("Failed to connect to listener")?;
        let (server, peer_addr) = listener.accept()?;
        info!(%addr, %peer_addr, "Loopback connection established");

        let (responder_tx, responder_closed) = unbounded();
        let responder = Node::start(
            config.clone(),
            Arc::new(Responder {
                registry: MessageRegistry::with_builtin(),
                closed: responder_tx,
            }),
            server,
            INITIATOR_PEER,
        )?;

        let (pong_tx, pongs) = unbounded();
        let (initiator_tx, initiator_closed) = unbounded();
        let initiator = Node::start(
            config,
            Arc::new(Initiator {
                registry: MessageRegistry::with_builtin(),
                pongs: pong_tx,
                closed: initiator_tx,
            }),
            client,
            RESPONDER_PEER,
        )?;

        Ok(Self {
            initiator,
            responder,
            pongs,
            initiator_closed,
            responder_closed,
        })
    }

    pub fn send_ping(&self, id: u64) -> Result<()> {
        let engine = &self.initiator.engine;
        let session = engine
            .try_get_session_by_peer(RESPONDER_PEER)
            .ok_or_else(|| anyhow!("no session bound to {}", RESPONDER_PEER))?;
        send_message(engine, session.session_id, &Ping { id })?;
        Ok(())
    }

    /// Send bytes that bypass the codec
    pub fn send_raw(&self, payload: &[u8]) -> Result<()> {
        self.initiator
            .engine
            .send(self.initiator.session, payload)?;
        Ok(())
    }

    pub fn recv_pong(&self, timeout: Duration) -> Option<PongEvent> {
        self.pongs.recv_timeout(timeout).ok()
    }

    pub fn initiator_closed(&self, timeout: Duration) -> Option<SessionId> {
        self.initiator_closed.recv_timeout(timeout).ok()
    }

    pub fn responder_closed(&self, timeout: Duration) -> Option<SessionId> {
        self.responder_closed.recv_timeout(timeout).ok()
    }

    pub fn shutdown(self) -> Result<()> {
        self.initiator.engine.shutdown()?;
        self.responder.engine.shutdown()?;
        Ok(())
    }
}

//! Strand Agent
//!
//! Per-process façade for joining the instance: registers with the
//! Coordinator, listens for inbound datagrams, and routes them. Control
//! exchanges (registration, barrier, discovery, shared listen) are resolved
//! in-agent through request/response correlation; everything else is handed
//! to a small registry of opcode handlers so unrelated subsystems
//! (cache-manager aggregation, SNMP) can plug into the same inbound channel
//! without the agent knowing their payload formats.

use crate::fdpass;
use crate::ledger::{LedgerHold, StartupLedger};
use crate::messenger::{Messenger, MessengerConfig};
use crate::{IpcError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use wire::{
    coordinator_endpoint, strand_endpoint, ListenSpec, Message, Opcode, QuestionerId, RequestId,
    StrandCoord,
};

/// Handler for opcodes the agent does not interpret itself
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, fd: Option<OwnedFd>) -> Result<()>;
}

/// Strand agent knobs
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding every endpoint of the instance
    pub socket_dir: PathBuf,
    /// How long to wait for the registration acknowledgment. A Coordinator
    /// that cannot answer within this window indicates a broken instance;
    /// the caller treats the resulting error as fatal.
    pub registration_timeout: Duration,
    pub messenger: MessengerConfig,
}

impl AgentConfig {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            registration_timeout: Duration::from_secs(6),
            messenger: MessengerConfig::default(),
        }
    }
}

#[derive(Default)]
struct AgentState {
    register_sent: bool,
    /// At most one outstanding barrier wait per process
    pending_sync: Option<(oneshot::Sender<()>, LedgerHold)>,
    pending_finds: HashMap<u64, oneshot::Sender<StrandCoord>>,
    pending_listens: HashMap<u64, oneshot::Sender<(i32, Option<OwnedFd>)>>,
    next_index: u64,
}

struct AgentInner {
    coord: StrandCoord,
    questioner: QuestionerId,
    config: AgentConfig,
    messenger: Messenger,
    socket: UnixDatagram,
    state: Mutex<AgentState>,
    handlers: RwLock<HashMap<Opcode, Box<dyn MessageHandler>>>,
    registered_tx: watch::Sender<bool>,
    ledger: StartupLedger,
}

/// Per-process coordination façade; cheap to clone
#[derive(Clone)]
pub struct StrandAgent {
    inner: Arc<AgentInner>,
}

impl StrandAgent {
    /// Bind this strand's endpoint and start the inbound loop.
    ///
    /// `coord.pid` must be the calling process (see [`StrandCoord::new`]);
    /// the registration acknowledgment is verified against it.
    pub fn bind(coord: StrandCoord, config: AgentConfig, ledger: StartupLedger) -> Result<Self> {
        let path = strand_endpoint(&config.socket_dir, coord.kid);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| IpcError::io(format!("removing stale socket {}", path.display()), e))?;
        }
        let socket = UnixDatagram::bind(&path)
            .map_err(|e| IpcError::io(format!("binding {}", path.display()), e))?;
        debug!(coord = %coord, path = %path.display(), "strand endpoint bound");

        let messenger = Messenger::spawn(config.messenger.clone());
        let (registered_tx, _) = watch::channel(false);
        let inner = Arc::new(AgentInner {
            questioner: QuestionerId(coord.pid),
            coord,
            config,
            messenger,
            socket,
            state: Mutex::new(AgentState::default()),
            handlers: RwLock::new(HashMap::new()),
            registered_tx,
            ledger,
        });

        tokio::spawn(listen(Arc::clone(&inner)));
        Ok(Self { inner })
    }

    pub fn coord(&self) -> &StrandCoord {
        &self.inner.coord
    }

    pub fn ledger(&self) -> &StartupLedger {
        &self.inner.ledger
    }

    pub fn is_registered(&self) -> bool {
        *self.inner.registered_tx.borrow()
    }

    /// Register an opcode handler; later registrations replace earlier ones
    pub async fn add_handler(&self, opcode: Opcode, handler: Box<dyn MessageHandler>) {
        if self
            .inner
            .handlers
            .write()
            .await
            .insert(opcode, handler)
            .is_some()
        {
            warn!(%opcode, "replacing an existing message handler");
        }
    }

    /// Join the instance: send the registration and await the acknowledgment.
    ///
    /// Repeated calls before the first acknowledgment do not re-send; they
    /// just wait. A timeout means the Coordinator is unresponsive and the
    /// returned error is fatal to the process; there is no retry.
    pub async fn register(&self) -> Result<()> {
        let mut rx = self.inner.registered_tx.subscribe();
        if *rx.borrow() {
            return Ok(());
        }

        let must_send = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.register_sent, true)
        };
        if must_send {
            self.send_to_coordinator(&Message::RegisterStrand {
                coord: self.inner.coord.clone(),
                questioner: self.inner.questioner,
            })?;
        }

        timeout(
            self.inner.config.registration_timeout,
            rx.wait_for(|registered| *registered),
        )
        .await
        .map_err(|_| {
            IpcError::registration(format!(
                "no acknowledgment from the coordinator within {:?}",
                self.inner.config.registration_timeout
            ))
        })?
        .map_err(|_| IpcError::transport("agent inbound loop ended during registration"))?;

        info!(coord = %self.inner.coord, "registered with the coordinator");
        Ok(())
    }

    /// Block until every strand of the cohort has reached the startup
    /// barrier. At most one outstanding wait per process; a second call
    /// while one is pending is a contract violation and panics.
    pub async fn barrier_wait(&self) -> Result<()> {
        let rx = {
            let mut state = self.inner.state.lock();
            assert!(
                state.pending_sync.is_none(),
                "a barrier wait is already outstanding in this process"
            );
            let (tx, rx) = oneshot::channel();
            state.pending_sync = Some((tx, self.inner.ledger.hold()));
            rx
        };

        self.send_to_coordinator(&Message::SynchronizationRequest {
            coord: self.inner.coord.clone(),
            questioner: self.inner.questioner,
        })?;

        rx.await
            .map_err(|_| IpcError::transport("agent inbound loop ended during barrier wait"))?;
        debug!(coord = %self.inner.coord, "startup barrier crossed");
        Ok(())
    }

    /// Find the strand advertising `tag`. Resolves whenever that strand
    /// registers; the coordination protocol never drops a discovery request.
    pub async fn find_strand(&self, tag: impl Into<String>) -> Result<StrandCoord> {
        let tag = tag.into();
        let (request, rx) = {
            let mut state = self.inner.state.lock();
            let index = state.next_index;
            state.next_index += 1;
            let (tx, rx) = oneshot::channel();
            state.pending_finds.insert(index, tx);
            (RequestId::new(self.inner.questioner, index), rx)
        };

        self.send_to_coordinator(&Message::FindStrand {
            coord: self.inner.coord.clone(),
            request,
            tag: tag.clone(),
        })?;

        let coord = rx
            .await
            .map_err(|_| IpcError::transport("agent inbound loop ended during discovery"))?;
        trace!(%tag, found = %coord, "strand discovered");
        Ok(coord)
    }

    /// Ask the Coordinator for a shared listening socket, opened once per
    /// spec and duplicated to every asker.
    pub async fn shared_listen(&self, spec: ListenSpec) -> Result<OwnedFd> {
        let (request, rx) = {
            let mut state = self.inner.state.lock();
            let index = state.next_index;
            state.next_index += 1;
            let (tx, rx) = oneshot::channel();
            state.pending_listens.insert(index, tx);
            (RequestId::new(self.inner.questioner, index), rx)
        };

        self.send_to_coordinator(&Message::SharedListenRequest {
            coord: self.inner.coord.clone(),
            request,
            spec: spec.clone(),
        })?;

        let (error, fd) = rx
            .await
            .map_err(|_| IpcError::transport("agent inbound loop ended during shared listen"))?;
        if error != 0 {
            return Err(IpcError::io(
                format!("coordinator could not listen on {spec}"),
                std::io::Error::from_raw_os_error(error),
            ));
        }
        fd.ok_or_else(|| IpcError::protocol("shared-listen response arrived without a descriptor"))
    }

    /// Tell the Coordinator this process finished its own startup.
    /// Fire-and-forget: there is no response.
    pub fn completed_startup(&self) -> Result<()> {
        self.send_to_coordinator(&Message::KidCompletedStartup {
            kid: self.inner.coord.kid,
        })
    }

    fn send_to_coordinator(&self, message: &Message) -> Result<()> {
        self.inner
            .messenger
            .send(coordinator_endpoint(&self.inner.config.socket_dir), message)
    }
}

impl std::fmt::Debug for StrandAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandAgent")
            .field("coord", &self.inner.coord)
            .field("registered", &*self.inner.registered_tx.borrow())
            .finish()
    }
}

/// Inbound loop: one datagram decoded and dispatched at a time, to
/// completion, before the next is read
async fn listen(inner: Arc<AgentInner>) {
    let mut buf = vec![0u8; wire::MAX_FRAME];
    loop {
        match fdpass::recv_from(&inner.socket, &mut buf).await {
            Ok((len, fd)) => match wire::decode(&buf[..len]) {
                Ok(message) => dispatch(&inner, message, fd).await,
                Err(e) => warn!(coord = %inner.coord, error = %e, "dropping undecodable frame"),
            },
            Err(e) => {
                error!(coord = %inner.coord, error = %e, "agent socket failed; inbound loop ends");
                return;
            }
        }
    }
}

async fn dispatch(inner: &Arc<AgentInner>, message: Message, fd: Option<OwnedFd>) {
    match message {
        Message::StrandRegistered { coord } => {
            // The ack must name this very incarnation: same kid id and same
            // OS pid. An ack addressed to a dead predecessor with our kid id
            // fails the pid check and is ignored.
            if coord.kid == inner.coord.kid && coord.pid == inner.coord.pid {
                inner.registered_tx.send_replace(true);
            } else {
                warn!(
                    ours = %inner.coord,
                    acked = %coord,
                    "ignoring registration ack for a different incarnation"
                );
            }
        }

        Message::SynchronizationResponse { kid } => {
            let pending = inner.state.lock().pending_sync.take();
            match pending {
                Some((tx, hold)) => {
                    let _ = tx.send(());
                    drop(hold);
                }
                None => warn!(kid, "unsolicited synchronization response"),
            }
        }

        Message::StrandReady { request, coord } => {
            if request.questioner != inner.questioner {
                warn!(
                    request = %request,
                    "discovery answer addressed to a previous incarnation; ignoring"
                );
                return;
            }
            let waiter = inner.state.lock().pending_finds.remove(&request.index);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(coord);
                }
                None => warn!(request = %request, "discovery answer for an unknown request"),
            }
        }

        Message::SharedListenResponse { request, error } => {
            if request.questioner != inner.questioner {
                warn!(
                    request = %request,
                    "shared-listen answer addressed to a previous incarnation; ignoring"
                );
                return;
            }
            let waiter = inner.state.lock().pending_listens.remove(&request.index);
            match waiter {
                Some(tx) => {
                    let _ = tx.send((error, fd));
                }
                None => warn!(request = %request, "shared-listen answer for an unknown request"),
            }
        }

        other => {
            let opcode = other.opcode();
            let handlers = inner.handlers.read().await;
            match handlers.get(&opcode) {
                Some(handler) => {
                    if let Err(e) = handler.handle(other, fd).await {
                        warn!(%opcode, error = %e, "message handler failed");
                    }
                }
                None => warn!(%opcode, "no handler registered; dropping message"),
            }
        }
    }
}

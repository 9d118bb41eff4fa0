//! Coordinator: Strand Registry & Startup Barrier
//!
//! The single distinguished process of the instance. [`StrandRegistry`] is
//! the authoritative map of known strands, the queue of pending discovery
//! requests, and the barrier/readiness state machine. It is pure message
//! logic: it consumes one inbound message and returns the outbound messages
//! to send, so every barrier property is testable without a socket.
//! [`Coordinator`] owns the socket, the messenger, the shared-listen socket
//! cache, and the opcode handler registry, and applies the registry's
//! outputs.
//!
//! Barrier rules: a kid satisfies the barrier either by asking to
//! synchronize or by reporting full startup completion without ever asking
//! (a legitimate bypass for strands with no synchronized dependencies).
//! When all kids `1..=cohort` satisfy one of the two, the one-way `crossed`
//! latch flips and every asker is notified exactly once. The latch never
//! regresses; restarted strands that re-ask are answered immediately.

use crate::agent::MessageHandler;
use crate::fdpass;
use crate::messenger::{Messenger, MessengerConfig};
use crate::{IpcError, Result};
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use tokio::net::UnixDatagram;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use wire::{
    coordinator_endpoint, strand_endpoint, KidId, ListenSpec, Message, Opcode, RequestId,
    StrandCoord,
};

/// One message the registry wants delivered to a strand
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: KidId,
    pub message: Message,
}

#[derive(Debug, Clone)]
struct PendingFind {
    asker: KidId,
    request: RequestId,
    tag: String,
}

/// Authoritative strand map plus barrier and readiness state.
///
/// The cohort size (workers + disk processes, excluding the Coordinator
/// itself) is fixed for the instance lifetime.
pub struct StrandRegistry {
    cohort: u32,
    strands: HashMap<KidId, StrandCoord>,
    pending_finds: Vec<PendingFind>,
    /// Kids that asked to synchronize
    syncing: HashSet<KidId>,
    /// Kids whose synchronization response has been sent
    notified: HashSet<KidId>,
    /// Kids that reported full startup completion
    completed: HashSet<KidId>,
    /// One-way barrier latch
    crossed: bool,
    /// One-way whole-instance readiness latch
    ready_tx: watch::Sender<bool>,
}

impl StrandRegistry {
    pub fn new(cohort: u32) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            cohort,
            strands: HashMap::new(),
            pending_finds: Vec::new(),
            syncing: HashSet::new(),
            notified: HashSet::new(),
            completed: HashSet::new(),
            crossed: false,
            ready_tx,
        }
    }

    pub fn cohort(&self) -> u32 {
        self.cohort
    }

    pub fn strand(&self, kid: KidId) -> Option<&StrandCoord> {
        self.strands.get(&kid)
    }

    pub fn strand_count(&self) -> usize {
        self.strands.len()
    }

    pub fn pending_find_count(&self) -> usize {
        self.pending_finds.len()
    }

    pub fn crossed(&self) -> bool {
        self.crossed
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Readiness latch observer; flips to `true` exactly once
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Consume one inbound message, returning the responses to deliver
    pub fn handle(&mut self, message: Message) -> Vec<Outbound> {
        match message {
            Message::RegisterStrand { coord, questioner } => {
                trace!(%coord, %questioner, "registration received");
                self.register(coord)
            }
            Message::FindStrand {
                coord,
                request,
                tag,
            } => self.find(coord.kid, request, tag),
            Message::SynchronizationRequest { coord, .. } => self.synchronize(coord.kid),
            Message::KidCompletedStartup { kid } => self.completed_startup(kid),
            other => {
                warn!(opcode = %other.opcode(), "registry cannot interpret this opcode");
                Vec::new()
            }
        }
    }

    /// Insert or overwrite the entry for a (possibly restarted) strand
    fn register(&mut self, coord: StrandCoord) -> Vec<Outbound> {
        let mut out = Vec::new();
        let kid = coord.kid;

        // A re-registration without a tag keeps the tag we already know.
        let merged = match self.strands.get(&kid) {
            Some(prev) if coord.tag.is_none() && prev.tag.is_some() => StrandCoord {
                tag: prev.tag.clone(),
                ..coord
            },
            _ => coord,
        };

        if self.strands.insert(kid, merged.clone()).is_some() {
            debug!(coord = %merged, "strand re-registered; clearing stale barrier bookkeeping");
        } else {
            info!(coord = %merged, "strand registered");
        }

        // A restarted strand starts its barrier life over; the crossed
        // latch itself never regresses.
        self.syncing.remove(&kid);
        self.notified.remove(&kid);
        self.completed.remove(&kid);

        out.push(Outbound {
            to: kid,
            message: Message::StrandRegistered {
                coord: merged.clone(),
            },
        });

        // Answer every discovery this registration satisfies, exactly once.
        self.pending_finds.retain(|pending| {
            if merged.has_tag(&pending.tag) {
                debug!(tag = %pending.tag, found = %merged, "queued discovery answered");
                out.push(Outbound {
                    to: pending.asker,
                    message: Message::StrandReady {
                        request: pending.request,
                        coord: merged.clone(),
                    },
                });
                false
            } else {
                true
            }
        });

        out
    }

    /// Answer a discovery immediately when possible, otherwise queue it.
    /// No request is ever dropped; each is answered exactly once.
    fn find(&mut self, asker: KidId, request: RequestId, tag: String) -> Vec<Outbound> {
        if let Some(found) = self.strands.values().find(|c| c.has_tag(&tag)) {
            return vec![Outbound {
                to: asker,
                message: Message::StrandReady {
                    request,
                    coord: found.clone(),
                },
            }];
        }
        debug!(%tag, asker, "strand not yet known; discovery queued");
        self.pending_finds.push(PendingFind {
            asker,
            request,
            tag,
        });
        Vec::new()
    }

    fn synchronize(&mut self, kid: KidId) -> Vec<Outbound> {
        let mut out = Vec::new();

        if self.crossed {
            // Late or restarted asker: answer from the latch without
            // re-running the cohort check.
            if self.notified.insert(kid) {
                out.push(sync_response(kid));
            } else {
                debug!(kid, "synchronization replay for an already-notified kid; skipping");
            }
            return out;
        }

        self.syncing.insert(kid);
        assert!(
            self.syncing.len() <= self.cohort as usize,
            "{} synchronizing strands exceed the cohort of {}",
            self.syncing.len(),
            self.cohort
        );

        self.check_barrier(&mut out);
        out
    }

    fn completed_startup(&mut self, kid: KidId) -> Vec<Outbound> {
        let mut out = Vec::new();

        if kid == 0 || kid > self.cohort {
            warn!(kid, cohort = self.cohort, "completion report from outside the cohort");
            return out;
        }

        self.completed.insert(kid);
        debug!(kid, completed = self.completed.len(), "startup completion recorded");

        if !self.crossed {
            self.check_barrier(&mut out);
        }
        self.check_ready();
        out
    }

    /// Flip the crossed latch once every expected kid has either asked to
    /// synchronize or completed startup without asking
    fn check_barrier(&mut self, out: &mut Vec<Outbound>) {
        if self.crossed {
            return;
        }
        let everyone = (1..=self.cohort)
            .all(|kid| self.syncing.contains(&kid) || self.completed.contains(&kid));
        if !everyone {
            return;
        }

        self.crossed = true;
        info!(cohort = self.cohort, "startup barrier crossed");

        for &kid in &self.syncing {
            if self.notified.insert(kid) {
                out.push(sync_response(kid));
            }
        }
    }

    /// Announce whole-instance readiness exactly once
    fn check_ready(&mut self) {
        if self.is_ready() {
            return;
        }
        let everyone = (1..=self.cohort).all(|kid| self.completed.contains(&kid));
        if everyone {
            info!(cohort = self.cohort, "all strands completed startup; instance ready");
            self.ready_tx.send_replace(true);
        }
    }
}

fn sync_response(kid: KidId) -> Outbound {
    Outbound {
        to: kid,
        message: Message::SynchronizationResponse { kid },
    }
}

impl std::fmt::Debug for StrandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandRegistry")
            .field("cohort", &self.cohort)
            .field("strands", &self.strands.len())
            .field("pending_finds", &self.pending_finds.len())
            .field("crossed", &self.crossed)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Coordinator knobs
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub socket_dir: PathBuf,
    /// Expected kids `1..=cohort`, excluding the Coordinator itself
    pub cohort: u32,
    pub messenger: MessengerConfig,
}

impl CoordinatorConfig {
    pub fn new(socket_dir: impl Into<PathBuf>, cohort: u32) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            cohort,
            messenger: MessengerConfig::default(),
        }
    }
}

/// The Coordinator process: socket loop around the registry
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: StrandRegistry,
    socket: UnixDatagram,
    socket_path: PathBuf,
    messenger: Messenger,
    handlers: HashMap<Opcode, Box<dyn MessageHandler>>,
    /// Shared-listen cache: one socket per spec, duplicated per asker
    listeners: HashMap<ListenSpec, OwnedFd>,
}

impl Coordinator {
    /// Bind the Coordinator endpoint, replacing any stale socket file
    pub fn bind(config: CoordinatorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.socket_dir).map_err(|e| {
            IpcError::io(
                format!("creating socket dir {}", config.socket_dir.display()),
                e,
            )
        })?;

        let socket_path = coordinator_endpoint(&config.socket_dir);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                IpcError::io(format!("removing stale socket {}", socket_path.display()), e)
            })?;
        }
        let socket = UnixDatagram::bind(&socket_path)
            .map_err(|e| IpcError::io(format!("binding {}", socket_path.display()), e))?;
        info!(path = %socket_path.display(), cohort = config.cohort, "coordinator listening");

        let messenger = Messenger::spawn(config.messenger.clone());
        let registry = StrandRegistry::new(config.cohort);
        Ok(Self {
            config,
            registry,
            socket,
            socket_path,
            messenger,
            handlers: HashMap::new(),
            listeners: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &StrandRegistry {
        &self.registry
    }

    /// Whole-instance readiness latch observer
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.registry.ready()
    }

    /// Register an opcode handler; later registrations replace earlier ones
    pub fn add_handler(&mut self, opcode: Opcode, handler: Box<dyn MessageHandler>) {
        if self.handlers.insert(opcode, handler).is_some() {
            warn!(%opcode, "replacing an existing message handler");
        }
    }

    /// Serve inbound datagrams until the socket fails
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; wire::MAX_FRAME];
        loop {
            let (len, fd) = fdpass::recv_from(&self.socket, &mut buf)
                .await
                .map_err(|e| IpcError::io("coordinator socket receive failed", e))?;
            if fd.is_some() {
                warn!("unexpected inbound descriptor; closing it");
            }
            match wire::decode(&buf[..len]) {
                Ok(message) => self.dispatch(message).await,
                Err(e) => warn!(error = %e, "dropping undecodable frame"),
            }
        }
    }

    async fn dispatch(&mut self, message: Message) {
        match message {
            Message::SharedListenRequest {
                coord,
                request,
                spec,
            } => self.shared_listen(coord.kid, request, spec),

            opaque @ (Message::CacheMgrRequest { .. }
            | Message::CacheMgrResponse { .. }
            | Message::SnmpRequest { .. }
            | Message::SnmpResponse { .. }) => {
                let opcode = opaque.opcode();
                match self.handlers.get(&opcode) {
                    Some(handler) => {
                        if let Err(e) = handler.handle(opaque, None).await {
                            warn!(%opcode, error = %e, "message handler failed");
                        }
                    }
                    None => warn!(%opcode, "no handler registered; dropping message"),
                }
            }

            registrable => {
                for outbound in self.registry.handle(registrable) {
                    self.deliver(outbound);
                }
            }
        }
    }

    fn deliver(&self, outbound: Outbound) {
        let dest = strand_endpoint(&self.config.socket_dir, outbound.to);
        if let Err(e) = self.messenger.send(dest, &outbound.message) {
            warn!(to = outbound.to, error = %e, "failed to queue outbound message");
        }
    }

    /// Open (or reuse) the listening socket for `spec` and send the asker a
    /// duplicate of its descriptor; failures travel back as errno codes.
    fn shared_listen(&mut self, asker: KidId, request: RequestId, spec: ListenSpec) {
        let dest = strand_endpoint(&self.config.socket_dir, asker);
        match self.listener_for(&spec) {
            Ok(fd) => {
                debug!(%spec, asker, "shared listener handed out");
                let response = Message::SharedListenResponse { request, error: 0 };
                if let Err(e) = self.messenger.send_with_fd(dest, &response, fd) {
                    warn!(%spec, asker, error = %e, "failed to queue shared-listen response");
                }
            }
            Err(errno) => {
                warn!(%spec, asker, errno, "shared listen failed");
                let response = Message::SharedListenResponse {
                    request,
                    error: errno,
                };
                if let Err(e) = self.messenger.send(dest, &response) {
                    warn!(%spec, asker, error = %e, "failed to queue shared-listen failure");
                }
            }
        }
    }

    fn listener_for(&mut self, spec: &ListenSpec) -> std::result::Result<OwnedFd, i32> {
        const FALLBACK_ERRNO: i32 = 5; // EIO, for errors without an errno

        if let Some(fd) = self.listeners.get(spec) {
            return fd
                .try_clone()
                .map_err(|e| e.raw_os_error().unwrap_or(FALLBACK_ERRNO));
        }

        let listener = std::net::TcpListener::bind((spec.address.as_str(), spec.port))
            .map_err(|e| e.raw_os_error().unwrap_or(FALLBACK_ERRNO))?;
        let fd: OwnedFd = listener.into();
        let dup = fd
            .try_clone()
            .map_err(|e| e.raw_os_error().unwrap_or(FALLBACK_ERRNO))?;
        self.listeners.insert(spec.clone(), fd);
        Ok(dup)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

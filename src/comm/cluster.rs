//! Star-routed cluster communicator.
//!
//! On the master this owns `size - 1` links indexed by peer rank plus a
//! router task; on a worker it owns a single link to rank 0. All traffic,
//! including logically worker-to-worker messages, traverses rank 0: the
//! router classifies every inbound envelope — destined for rank 0 it goes
//! to the local per-sender FIFO, otherwise it is wrapped in `Routed` and
//! forwarded on the link to the target. FIFO per (from, to) pair holds
//! because each inbound link has a single reader and each outbound link a
//! single writer.
//!
//! Control envelopes (`Cancel`, `Shutdown`, `Ready`, `Done`, `Fail`)
//! bypass the data FIFOs and are handled inline by the router or the
//! worker dispatch task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::time::{timeout, Instant};

use crate::cancel::CancelFlag;
use crate::comm::Communicator;
use crate::error::{FlotillaError, Result};
use crate::link::{Link, LinkEvent};
use crate::protocol::{Envelope, Message, Payload, Rank, MASTER_RANK};

/// Per-peer receive FIFO depth. When a receiver falls this far behind, the
/// sender's link backs up and its `send` calls suspend.
pub const DATA_FIFO: usize = 64;

const INBOUND_QUEUE: usize = 64;

#[derive(Clone)]
pub struct ClusterComm {
    inner: Arc<CommInner>,
}

struct CommInner {
    rank: Rank,
    size: u32,
    cancel: CancelFlag,
    collective_deadline: Option<Duration>,
    /// How long in-flight traffic may still land after cancellation before
    /// a blocked call gives up with `Cancelled`.
    drain_grace: Duration,
    /// Keyed by peer rank on the master; the single uplink under
    /// `MASTER_RANK` on a worker.
    outbound: HashMap<Rank, mpsc::Sender<Envelope>>,
    /// Envelope sequence counters, indexed by destination rank.
    send_seq: Arc<Vec<AtomicU64>>,
    inboxes: HashMap<Rank, AsyncMutex<mpsc::Receiver<Payload>>>,
    links: std::sync::Mutex<Vec<Link>>,
}

impl ClusterComm {
    /// Master-side communicator over freshly handshaken worker sockets.
    pub fn master(
        streams: Vec<(Rank, TcpStream)>,
        size: u32,
        cancel: CancelFlag,
        collective_deadline: Option<Duration>,
        drain_grace: Duration,
    ) -> (Self, Arc<JobTracker>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let mut links = Vec::with_capacity(streams.len());
        let mut outbound = HashMap::new();
        for (rank, stream) in streams {
            let link = Link::spawn(stream, rank, inbound_tx.clone(), cancel.clone());
            outbound.insert(rank, link.sender());
            links.push(link);
        }
        drop(inbound_tx);

        let send_seq = Arc::new((0..size).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
        let (demux, receivers) = Demux::new((1..size).collect());
        let tracker = Arc::new(JobTracker::new(size));

        let router = Router {
            size,
            inbound: inbound_rx,
            outbound: outbound.clone(),
            send_seq: send_seq.clone(),
            demux,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        };
        tokio::spawn(router.run());

        let comm = Self {
            inner: Arc::new(CommInner {
                rank: MASTER_RANK,
                size,
                cancel,
                collective_deadline,
                drain_grace,
                outbound,
                send_seq,
                inboxes: into_inboxes(receivers),
                links: std::sync::Mutex::new(links),
            }),
        };
        (comm, tracker)
    }

    /// Worker-side communicator over the established uplink to rank 0.
    pub fn worker(
        stream: TcpStream,
        rank: Rank,
        size: u32,
        cancel: CancelFlag,
        drain_grace: Duration,
    ) -> (Self, Arc<WorkerSignals>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let link = Link::spawn(stream, MASTER_RANK, inbound_tx, cancel.clone());

        let mut outbound = HashMap::new();
        outbound.insert(MASTER_RANK, link.sender());

        let send_seq = Arc::new((0..size).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
        let peers = (0..size).filter(|r| *r != rank).collect();
        let (demux, receivers) = Demux::new(peers);
        let signals = Arc::new(WorkerSignals::new());

        let dispatch = WorkerDispatch {
            rank,
            inbound: inbound_rx,
            demux,
            cancel: cancel.clone(),
            signals: signals.clone(),
        };
        tokio::spawn(dispatch.run());

        let comm = Self {
            inner: Arc::new(CommInner {
                rank,
                size,
                cancel,
                collective_deadline: None,
                drain_grace,
                outbound,
                send_seq,
                inboxes: into_inboxes(receivers),
                links: std::sync::Mutex::new(vec![link]),
            }),
        };
        (comm, signals)
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.inner.cancel
    }

    /// Send a control envelope, ignoring the cancellation flag: control
    /// traffic must still flow while a job drains.
    pub async fn send_control(&self, to: Rank, message: Message) -> Result<()> {
        self.send_message(to, message, false).await
    }

    /// Drain and close every link, master side first by convention.
    pub async fn close(&self, grace: Duration) {
        let links: Vec<Link> = {
            let mut guard = self.inner.links.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for link in links {
            link.close(grace).await;
        }
    }

    async fn send_message(&self, to: Rank, message: Message, observe_cancel: bool) -> Result<()> {
        if to == self.inner.rank {
            return Err(FlotillaError::Internal(format!(
                "rank {to} attempted to message itself"
            )));
        }
        if to >= self.inner.size {
            return Err(FlotillaError::Internal(format!(
                "destination rank {to} outside group of {}",
                self.inner.size
            )));
        }

        let key = if self.inner.rank == MASTER_RANK {
            to
        } else {
            MASTER_RANK
        };
        let tx = self
            .inner
            .outbound
            .get(&key)
            .ok_or(FlotillaError::PeerLost(to))?;

        let permit = if !observe_cancel {
            // Control traffic must flow even while a job drains.
            tx.reserve()
                .await
                .map_err(|_| FlotillaError::PeerLost(to))?
        } else if self.inner.cancel.is_set() {
            match timeout(self.inner.drain_grace, tx.reserve()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(FlotillaError::PeerLost(to)),
                Err(_) => return Err(FlotillaError::Cancelled),
            }
        } else {
            tokio::select! {
                biased;
                permit = tx.reserve() => permit.map_err(|_| FlotillaError::PeerLost(to))?,
                _ = self.inner.cancel.cancelled() => {
                    match timeout(self.inner.drain_grace, tx.reserve()).await {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(FlotillaError::PeerLost(to)),
                        Err(_) => return Err(FlotillaError::Cancelled),
                    }
                }
            }
        };

        let seq = self.inner.send_seq[to as usize].fetch_add(1, Ordering::Relaxed);
        permit.send(Envelope {
            from: self.inner.rank,
            to,
            seq,
            message,
        });
        Ok(())
    }

    async fn recv_data(&self, from: Rank) -> Result<Payload> {
        if from == self.inner.rank || from >= self.inner.size {
            return Err(FlotillaError::Internal(format!(
                "rank {} cannot receive from rank {from}",
                self.inner.rank
            )));
        }
        let slot = self
            .inner
            .inboxes
            .get(&from)
            .ok_or_else(|| FlotillaError::Internal(format!("no inbox for rank {from}")))?;
        let mut rx = slot.lock().await;

        if !self.inner.cancel.is_set() {
            tokio::select! {
                biased;
                msg = rx.recv() => return msg.ok_or(FlotillaError::PeerLost(from)),
                _ = self.inner.cancel.cancelled() => {}
            }
        }
        // Cancelled: in-flight envelopes may still complete the call
        // within the drain grace; after that the wait fails.
        match timeout(self.inner.drain_grace, rx.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(FlotillaError::PeerLost(from)),
            Err(_) => Err(FlotillaError::Cancelled),
        }
    }
}

impl Communicator for ClusterComm {
    fn rank(&self) -> Rank {
        self.inner.rank
    }

    fn size(&self) -> u32 {
        self.inner.size
    }

    async fn send(&self, to: Rank, payload: Payload) -> Result<()> {
        self.send_message(to, Message::Data(payload), true).await
    }

    async fn recv(&self, from: Rank) -> Result<Payload> {
        self.recv_data(from).await
    }

    async fn request_cancel(&self) -> Result<()> {
        if self.inner.rank == MASTER_RANK {
            self.inner.cancel.set();
            Ok(())
        } else {
            let sent = self.send_message(MASTER_RANK, Message::Cancel, false).await;
            self.inner.cancel.set();
            sent
        }
    }

    fn collective_deadline(&self) -> Option<Duration> {
        self.inner.collective_deadline
    }
}

fn into_inboxes(
    receivers: HashMap<Rank, mpsc::Receiver<Payload>>,
) -> HashMap<Rank, AsyncMutex<mpsc::Receiver<Payload>>> {
    receivers
        .into_iter()
        .map(|(rank, rx)| (rank, AsyncMutex::new(rx)))
        .collect()
}

/// Receive-side demultiplexer: one bounded FIFO per peer rank for `Data`
/// payloads, with per-pair sequence validation. Control traffic never
/// enters these queues.
struct Demux {
    senders: HashMap<Rank, mpsc::Sender<Payload>>,
    last_seq: HashMap<Rank, u64>,
}

impl Demux {
    fn new(peers: Vec<Rank>) -> (Self, HashMap<Rank, mpsc::Receiver<Payload>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for rank in peers {
            let (tx, rx) = mpsc::channel(DATA_FIFO);
            senders.insert(rank, tx);
            receivers.insert(rank, rx);
        }
        (
            Self {
                senders,
                last_seq: HashMap::new(),
            },
            receivers,
        )
    }

    async fn accept(&mut self, envelope: Envelope) -> Result<()> {
        let payload = match envelope.message {
            Message::Data(payload) => payload,
            other => {
                return Err(FlotillaError::Internal(format!(
                    "demux given a {} envelope",
                    other.kind()
                )))
            }
        };
        if let Some(&last) = self.last_seq.get(&envelope.from) {
            if envelope.seq <= last {
                return Err(FlotillaError::ProtocolViolation(format!(
                    "sequence regression from rank {}: {} after {}",
                    envelope.from, envelope.seq, last
                )));
            }
        }
        self.last_seq.insert(envelope.from, envelope.seq);
        match self.senders.get(&envelope.from) {
            Some(tx) => {
                // Suspends when the FIFO is full; backpressure reaches the
                // sender through the link.
                let _ = tx.send(payload).await;
                Ok(())
            }
            None => Err(FlotillaError::ProtocolViolation(format!(
                "data from unexpected rank {}",
                envelope.from
            ))),
        }
    }

    fn drop_peer(&mut self, rank: Rank) {
        self.senders.remove(&rank);
    }

    fn drop_all(&mut self) {
        self.senders.clear();
    }
}

/// Master-side view of worker lifecycle during a job.
#[derive(Debug, Default)]
pub struct TrackerState {
    pub ready: HashSet<Rank>,
    pub done: HashMap<Rank, Option<Payload>>,
    pub failed: HashMap<Rank, String>,
    pub lost: HashSet<Rank>,
    pub fault: Option<FlotillaError>,
    pub shutting_down: bool,
}

impl TrackerState {
    /// A worker is accounted for once it has reported in or is known gone.
    pub fn accounted(&self, rank: Rank) -> bool {
        self.done.contains_key(&rank) || self.failed.contains_key(&rank) || self.lost.contains(&rank)
    }
}

pub struct JobTracker {
    size: u32,
    state: std::sync::Mutex<TrackerState>,
    notify: Notify,
}

impl JobTracker {
    fn new(size: u32) -> Self {
        Self {
            size,
            state: std::sync::Mutex::new(TrackerState::default()),
            notify: Notify::new(),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&TrackerState) -> R) -> R {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn update(&self, f: impl FnOnce(&mut TrackerState)) {
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard);
        }
        self.notify.notify_waiters();
    }

    pub fn set_shutting_down(&self) {
        self.update(|s| s.shutting_down = true);
    }

    pub fn take_fault(&self) -> Option<FlotillaError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.fault.take()
    }

    pub fn first_lost(&self) -> Option<Rank> {
        self.with_state(|s| s.lost.iter().min().copied())
    }

    /// First worker failure that is not part of a cancellation drain.
    pub fn first_failure(&self) -> Option<(Rank, String)> {
        self.with_state(|s| {
            s.failed
                .iter()
                .filter(|(_, reason)| reason.as_str() != "cancelled")
                .min_by_key(|(rank, _)| **rank)
                .map(|(rank, reason)| (*rank, reason.clone()))
        })
    }

    pub fn all_ready(&self) -> bool {
        self.with_state(|s| s.ready.len() as u32 == self.size - 1)
    }

    pub fn all_accounted(&self) -> bool {
        self.with_state(|s| (1..self.size).all(|r| s.accounted(r)))
    }

    /// Block until `pred` holds or `dur` elapses; returns whether it held.
    pub async fn wait_until(
        &self,
        pred: impl Fn(&TrackerState) -> bool,
        dur: Duration,
    ) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            let notified = self.notify.notified();
            if self.with_state(&pred) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if timeout(deadline - now, notified).await.is_err() {
                return self.with_state(&pred);
            }
        }
    }
}

enum Wake {
    Inbound(Option<(Rank, LinkEvent)>),
    Cancelled,
}

struct Router {
    size: u32,
    inbound: mpsc::Receiver<(Rank, LinkEvent)>,
    outbound: HashMap<Rank, mpsc::Sender<Envelope>>,
    send_seq: Arc<Vec<AtomicU64>>,
    demux: Demux,
    cancel: CancelFlag,
    tracker: Arc<JobTracker>,
}

impl Router {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut cancel_broadcast = false;
        loop {
            let wake = tokio::select! {
                biased;
                event = self.inbound.recv() => Wake::Inbound(event),
                _ = cancel.cancelled(), if !cancel_broadcast => Wake::Cancelled,
            };
            match wake {
                Wake::Cancelled => {
                    cancel_broadcast = true;
                    self.broadcast_cancel().await;
                }
                Wake::Inbound(None) => break,
                Wake::Inbound(Some((peer, LinkEvent::Frame(envelope)))) => {
                    if let Err(e) = self.handle_frame(peer, envelope).await {
                        self.fault(e);
                    }
                }
                Wake::Inbound(Some((peer, LinkEvent::Fault(reason)))) => {
                    self.fault(FlotillaError::ProtocolViolation(format!(
                        "rank {peer}: {reason}"
                    )));
                }
                Wake::Inbound(Some((peer, LinkEvent::Closed))) => self.peer_closed(peer),
            }
        }
    }

    async fn handle_frame(&mut self, peer: Rank, envelope: Envelope) -> Result<()> {
        if envelope.from != peer {
            return Err(FlotillaError::ProtocolViolation(format!(
                "rank {peer} sent an envelope claiming rank {}",
                envelope.from
            )));
        }
        match envelope.message {
            Message::Data(_) => {
                if envelope.to == MASTER_RANK {
                    self.demux.accept(envelope).await
                } else if envelope.to < self.size {
                    self.forward(envelope).await
                } else {
                    Err(FlotillaError::ProtocolViolation(format!(
                        "rank {peer} addressed nonexistent rank {}",
                        envelope.to
                    )))
                }
            }
            Message::Ready => {
                tracing::debug!(rank = peer, "worker ready");
                self.tracker.update(|s| {
                    s.ready.insert(peer);
                });
                Ok(())
            }
            Message::Done(result) => {
                tracing::debug!(rank = peer, "worker done");
                self.tracker.update(|s| {
                    s.done.insert(peer, result);
                });
                Ok(())
            }
            Message::Fail { reason } => {
                tracing::warn!(rank = peer, %reason, "worker failed");
                if reason != "cancelled" {
                    // A kernel error anywhere aborts the whole job.
                    self.cancel.set();
                }
                self.tracker.update(|s| {
                    s.failed.insert(peer, reason);
                });
                Ok(())
            }
            Message::Cancel => {
                tracing::info!(rank = peer, "cancellation requested by worker");
                self.cancel.set();
                Ok(())
            }
            other => Err(FlotillaError::ProtocolViolation(format!(
                "unexpected {} from rank {peer}",
                other.kind()
            ))),
        }
    }

    async fn forward(&mut self, envelope: Envelope) -> Result<()> {
        let to = envelope.to;
        let tx = match self.outbound.get(&to) {
            Some(tx) => tx,
            None => {
                return Err(FlotillaError::ProtocolViolation(format!(
                    "no route to rank {to}"
                )))
            }
        };
        let seq = self.send_seq[to as usize].fetch_add(1, Ordering::Relaxed);
        let outer = Envelope {
            from: MASTER_RANK,
            to,
            seq,
            message: Message::Routed(Box::new(envelope)),
        };
        if tx.send(outer).await.is_err() {
            self.peer_closed(to);
        }
        Ok(())
    }

    async fn broadcast_cancel(&mut self) {
        for (rank, tx) in &self.outbound {
            let seq = self.send_seq[*rank as usize].fetch_add(1, Ordering::Relaxed);
            let envelope = Envelope {
                from: MASTER_RANK,
                to: *rank,
                seq,
                message: Message::Cancel,
            };
            // Fire-and-forget; a dead link shows up as Closed separately.
            let _ = tx.send(envelope).await;
        }
    }

    fn peer_closed(&mut self, peer: Rank) {
        self.demux.drop_peer(peer);
        let benign = self
            .tracker
            .with_state(|s| s.shutting_down || s.accounted(peer));
        if benign {
            return;
        }
        tracing::warn!(rank = peer, "lost worker mid-job");
        self.tracker.update(|s| {
            s.lost.insert(peer);
        });
        self.cancel.set();
    }

    fn fault(&mut self, error: FlotillaError) {
        tracing::error!(error = %error, "router fault");
        self.tracker.update(|s| {
            if s.fault.is_none() {
                s.fault = Some(error);
            }
        });
        self.cancel.set();
    }
}

/// Worker-side lifecycle signals fed by the dispatch task.
pub struct WorkerSignals {
    phase_tx: watch::Sender<WorkerPhase>,
    fault: std::sync::Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Running,
    Shutdown,
    MasterGone,
}

impl WorkerSignals {
    fn new() -> Self {
        let (phase_tx, _) = watch::channel(WorkerPhase::Running);
        Self {
            phase_tx,
            fault: std::sync::Mutex::new(None),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase_tx.borrow()
    }

    pub fn take_fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Wait for the master's `Shutdown` (or for the uplink to go away).
    pub async fn wait_shutdown(&self, dur: Duration) {
        let mut rx = self.phase_tx.subscribe();
        let _ = timeout(dur, async {
            while *rx.borrow() == WorkerPhase::Running {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase_tx.send_replace(phase);
    }

    fn set_fault(&self, reason: String) {
        let mut guard = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }
}

struct WorkerDispatch {
    rank: Rank,
    inbound: mpsc::Receiver<(Rank, LinkEvent)>,
    demux: Demux,
    cancel: CancelFlag,
    signals: Arc<WorkerSignals>,
}

impl WorkerDispatch {
    async fn run(mut self) {
        while let Some((_, event)) = self.inbound.recv().await {
            match event {
                LinkEvent::Frame(envelope) => {
                    if let Err(e) = self.handle_frame(envelope).await {
                        self.signals.set_fault(e.to_string());
                        self.cancel.set();
                    }
                }
                LinkEvent::Fault(reason) => {
                    self.signals.set_fault(reason);
                    self.cancel.set();
                    // The reader is gone; no Shutdown will ever arrive.
                    self.demux.drop_all();
                    if self.signals.phase() == WorkerPhase::Running {
                        self.signals.set_phase(WorkerPhase::MasterGone);
                    }
                    return;
                }
                LinkEvent::Closed => {
                    self.demux.drop_all();
                    if self.signals.phase() == WorkerPhase::Running {
                        self.signals.set_phase(WorkerPhase::MasterGone);
                    }
                    return;
                }
            }
        }
    }

    async fn handle_frame(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.from != MASTER_RANK {
            return Err(FlotillaError::ProtocolViolation(format!(
                "uplink envelope claims rank {}",
                envelope.from
            )));
        }
        match envelope.message {
            Message::Data(_) => self.demux.accept(envelope).await,
            Message::Routed(inner) => {
                if inner.to != self.rank || !matches!(inner.message, Message::Data(_)) {
                    return Err(FlotillaError::ProtocolViolation(format!(
                        "bad routed envelope for rank {} ({})",
                        inner.to,
                        inner.message.kind()
                    )));
                }
                self.demux.accept(*inner).await
            }
            Message::Cancel => {
                self.cancel.set();
                Ok(())
            }
            Message::Shutdown => {
                self.signals.set_phase(WorkerPhase::Shutdown);
                Ok(())
            }
            other => Err(FlotillaError::ProtocolViolation(format!(
                "unexpected {} on worker uplink",
                other.kind()
            ))),
        }
    }
}

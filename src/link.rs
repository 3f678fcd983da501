//! A single reliable, ordered, full-duplex stream to one peer.
//!
//! Each link owns its TCP socket and two long-lived tasks: a writer
//! draining a bounded outbound queue of envelopes, and a reader parsing
//! frames and handing them to the owning communicator. A frame that was
//! accepted into the queue is either delivered whole or the link turns
//! `Broken` and the failure surfaces as `peer_lost` on the next call
//! touching this peer.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cancel::CancelFlag;
use crate::error::{FlotillaError, Result};
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::{Envelope, Message, Rank};

/// Outbound queue depth per link. A full queue suspends `send` callers,
/// which is the backpressure path all the way from a slow receiver.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Draining,
    Closed,
    Broken,
}

/// What a link reader reports to the owning communicator.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(Envelope),
    /// Undecodable or oversize inbound frame; fatal.
    Fault(String),
    /// The peer closed or the socket died.
    Closed,
}

pub struct Link {
    peer: Rank,
    outbound: mpsc::Sender<Envelope>,
    state_tx: Arc<watch::Sender<LinkState>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Take ownership of a connected socket and start the reader and
    /// writer tasks. Inbound frames are delivered to `inbound` tagged with
    /// `peer`. `Cancel` envelopes additionally set `cancel` at read time,
    /// ahead of the bounded queues, so cancellation overtakes backlogged
    /// data.
    pub fn spawn(
        stream: TcpStream,
        peer: Rank,
        inbound: mpsc::Sender<(Rank, LinkEvent)>,
        cancel: CancelFlag,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let (read_half, write_half) = stream.into_split();
        state_tx.send_replace(LinkState::Open);

        let writer = tokio::spawn(writer_loop(write_half, outbound_rx, state_tx.clone(), peer));
        let reader = tokio::spawn(reader_loop(
            read_half,
            inbound,
            state_tx.clone(),
            peer,
            cancel,
        ));

        Self {
            peer,
            outbound: outbound_tx,
            state_tx,
            writer,
            reader,
        }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// A handle for enqueueing envelopes from other tasks (the router).
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    /// Enqueue one envelope, suspending while the outbound queue is full.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| FlotillaError::PeerLost(self.peer))
    }

    /// Drain pending writes, then close the socket. The reader is torn
    /// down once the grace period expires.
    pub async fn close(self, grace: Duration) {
        self.state_tx.send_replace(LinkState::Draining);
        drop(self.outbound);
        let _ = tokio::time::timeout(grace, self.writer).await;
        self.reader.abort();
        let _ = self.reader.await;
        if *self.state_tx.borrow() != LinkState::Broken {
            self.state_tx.send_replace(LinkState::Closed);
        }
    }
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Envelope>,
    state: Arc<watch::Sender<LinkState>>,
    peer: Rank,
) {
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = write_frame(&mut write_half, &envelope).await {
            tracing::warn!(peer, error = %e, "link write failed");
            state.send_replace(LinkState::Broken);
            outbound.close();
            return;
        }
    }
    // All senders dropped: drained and done.
    let _ = write_half.shutdown().await;
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    inbound: mpsc::Sender<(Rank, LinkEvent)>,
    state: Arc<watch::Sender<LinkState>>,
    peer: Rank,
    cancel: CancelFlag,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(envelope) => {
                if matches!(envelope.message, Message::Cancel) {
                    cancel.set();
                }
                if inbound.send((peer, LinkEvent::Frame(envelope))).await.is_err() {
                    // Owner is gone; nothing left to deliver to.
                    return;
                }
            }
            Err(FlotillaError::ProtocolViolation(reason)) => {
                tracing::error!(peer, %reason, "fatal frame on link");
                state.send_replace(LinkState::Broken);
                let _ = inbound.send((peer, LinkEvent::Fault(reason))).await;
                return;
            }
            Err(e) => {
                let draining = matches!(
                    *state.borrow(),
                    LinkState::Draining | LinkState::Closed
                );
                if !draining {
                    tracing::debug!(peer, error = %e, "link read ended");
                    state.send_replace(LinkState::Broken);
                }
                let _ = inbound.send((peer, LinkEvent::Closed)).await;
                return;
            }
        }
    }
}

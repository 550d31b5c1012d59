//! A loopback peer for the engine.
//!
//! The demo plays both the remote TCP and the segment builder: it builds the
//! peer's segments, reads the engine's events and reports them back as sent.
//! One passive connection is opened, carries data both ways and is closed by
//! the peer.

use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};
use toe_core::{
    wire::{BuildHeaderError, TcpHeaderBuilder},
    AppNotification, Event, EventKind, Ipv4Address, RuntimeError, RuntimeOutputs, RxPacket,
    Runtime, SessionId, ToeConfig, ToeHandle, TxSent, WriteStatus,
};

const PEER_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const PEER_PORT: u16 = 40000;
const PEER_ISS: u32 = 1000;
const PEER_WINDOW: u16 = 0xffff;
const REPLY: &[u8] = b"Received";
/// How long to wait for any one answer from the engine
const PATIENCE: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(1);
const STEPS_PER_TICK: usize = 256;

#[derive(Debug, ThisError)]
pub enum DemoError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("Could not build a segment: {0}")]
    Header(#[from] BuildHeaderError),
    #[error("Port {0} refused the listen")]
    ListenRefused(u16),
    #[error("Gave up waiting for {0}")]
    Timeout(&'static str),
    #[error("The engine refused the reply: {0:?}")]
    WriteRefused(WriteStatus),
    #[error("Read back {read} bytes that differ from the {sent} sent")]
    Mismatch { sent: usize, read: usize },
}

/// What happened to the demo connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoReport {
    pub session: SessionId,
    /// Bytes the application read
    pub received: usize,
    /// Bytes the application wrote
    pub sent: usize,
    /// Whether the application was told the connection closed
    pub closed: bool,
}

/// The remote end of the connection.
struct Peer {
    handle: ToeHandle,
    outputs: RuntimeOutputs,
    local: Ipv4Address,
    port: u16,
    /// Next sequence number the peer sends
    seq: u32,
    /// Next sequence number the peer expects
    ack: u32,
}

impl Peer {
    async fn send(&mut self, segment: TcpHeaderBuilder, payload: &[u8]) -> Result<(), DemoError> {
        let segment = segment.wnd(PEER_WINDOW).segment(PEER_ADDRESS, self.local, payload)?;
        self.handle
            .packet(RxPacket {
                src: PEER_ADDRESS,
                dst: self.local,
                segment,
            })
            .await?;
        Ok(())
    }

    fn header(&self) -> TcpHeaderBuilder {
        TcpHeaderBuilder::new(PEER_PORT, self.port, self.seq)
    }

    /// Waits for an event of the given kind, acting as the segment builder
    /// for every event seen on the way.
    async fn expect_event(&mut self, kind: EventKind, what: &'static str) -> Result<Event, DemoError> {
        loop {
            let event = recv(&mut self.outputs.events, what).await?;
            self.transmit(&event).await?;
            if event.kind == kind {
                return Ok(event);
            }
        }
    }

    /// Reports an event's segment as sent and tracks what the peer expects.
    async fn transmit(&mut self, event: &Event) -> Result<(), DemoError> {
        tracing::debug!(kind = ?event.kind, "Peer received a segment");
        let Some(session) = event.session() else {
            return Ok(());
        };
        let advance = match event.kind {
            EventKind::SynAck => {
                self.ack = event.seq.unwrap_or(self.ack).wrapping_add(1);
                0
            }
            EventKind::Tx => event.length,
            EventKind::Fin => 1,
            _ => return Ok(()),
        };
        self.ack = self.ack.wrapping_add(advance);
        self.handle
            .report_sent(TxSent {
                session,
                kind: event.kind,
                next_byte: self.ack,
            })
            .await?;
        Ok(())
    }

    async fn expect_notification(&mut self, what: &'static str) -> Result<AppNotification, DemoError> {
        recv(&mut self.outputs.notifications, what).await
    }
}

async fn recv<T>(receiver: &mut UnboundedReceiver<T>, what: &'static str) -> Result<T, DemoError> {
    match timeout(PATIENCE, receiver.recv()).await {
        Ok(Some(item)) => Ok(item),
        Ok(None) => Err(RuntimeError::Stopped.into()),
        Err(_) => Err(DemoError::Timeout(what)),
    }
}

/// Runs one connection to `port` carrying `message` from the peer and a
/// short reply back, then closes it from the peer's side.
pub async fn run(config: ToeConfig, port: u16, message: Vec<u8>) -> Result<DemoReport, DemoError> {
    let local = config.local_address;
    let (runtime, outputs) = Runtime::start(config, TICK, STEPS_PER_TICK)?;
    let handle = runtime.handle();
    if !handle.listen(port).await? {
        return Err(DemoError::ListenRefused(port));
    }
    tracing::info!(port, "Demo listening");

    let mut peer = Peer {
        handle: handle.clone(),
        outputs,
        local,
        port,
        seq: PEER_ISS,
        ack: 0,
    };

    // Handshake
    peer.send(peer.header().syn(), &[]).await?;
    let syn_ack = peer.expect_event(EventKind::SynAck, "the SYN-ACK").await?;
    let session = syn_ack
        .session()
        .ok_or(DemoError::Timeout("the SYN-ACK's session"))?;
    peer.seq = peer.seq.wrapping_add(1);
    peer.send(peer.header().ack(peer.ack), &[]).await?;
    peer.expect_notification("the connection").await?;
    tracing::info!(%session, "Demo connection established");

    // Peer to application
    peer.send(peer.header().ack(peer.ack).psh(), &message).await?;
    peer.seq = peer.seq.wrapping_add(message.len() as u32);
    let notification = peer.expect_notification("the data").await?;
    let received = handle.read(session, notification.length).await?;
    if received != message {
        return Err(DemoError::Mismatch {
            sent: message.len(),
            read: received.len(),
        });
    }

    // Application to peer
    let reply = handle.write(session, REPLY.to_vec()).await?;
    if reply.status != WriteStatus::Ok {
        return Err(DemoError::WriteRefused(reply.status));
    }
    peer.expect_event(EventKind::Tx, "the reply").await?;

    // The peer closes, the engine answers with its own FIN
    peer.send(peer.header().ack(peer.ack).fin(), &[]).await?;
    peer.seq = peer.seq.wrapping_add(1);
    let closing = peer.expect_notification("the close").await?;
    peer.expect_event(EventKind::Fin, "the FIN").await?;
    peer.send(peer.header().ack(peer.ack), &[]).await?;
    tracing::info!(%session, "Demo connection closed");

    runtime.shutdown().await?;
    Ok(DemoReport {
        session,
        received: received.len(),
        sent: REPLY.len(),
        closed: closing.closed,
    })
}

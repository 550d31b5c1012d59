//! Drives an [`Engine`] from a tokio task.
//!
//! The engine lives in one spawned task and is stepped on every tick of a
//! [`tokio::time::interval`]. Everything else talks to it through a
//! [`ToeHandle`], which sends instructions over an mpsc channel and gets
//! answers back on oneshot channels. Outputs without a request to answer
//! (events, notifications, open results) are streamed on unbounded channels.

use crate::{
    address::Endpoint,
    config::{ConfigError, ToeConfig},
    engine::{Engine, SubmitError},
    types::{
        AppNotification, Event, OpenStatus, ReadRequest, RxPacket, SessionId, TxSent, WriteReply,
    },
    wire::from_words,
};
use std::{collections::VecDeque, time::Duration};
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// Steps allowed for finishing pending work on shutdown
const MAX_SHUTDOWN_STEPS: usize = 100_000;

#[derive(Debug)]
enum Instruction {
    Packet(RxPacket),
    Listen {
        port: u16,
        reply: oneshot::Sender<bool>,
    },
    Open(Endpoint),
    Close(SessionId),
    Write {
        session: SessionId,
        data: Vec<u8>,
        reply: oneshot::Sender<WriteReply>,
    },
    Read {
        request: ReadRequest,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Sent(TxSent),
    Probe(SessionId),
    Shutdown,
}

#[derive(Debug, ThisError)]
pub enum RuntimeError {
    #[error("Invalid engine configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("The engine task has stopped")]
    Stopped,
    #[error("The engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Streams of engine output that answer no particular request.
#[derive(Debug)]
pub struct RuntimeOutputs {
    /// Segments for the segment builder to send
    pub events: mpsc::UnboundedReceiver<Event>,
    pub notifications: mpsc::UnboundedReceiver<AppNotification>,
    pub open_statuses: mpsc::UnboundedReceiver<OpenStatus>,
}

#[derive(Debug)]
struct OutputSenders {
    events: mpsc::UnboundedSender<Event>,
    notifications: mpsc::UnboundedSender<AppNotification>,
    open_statuses: mpsc::UnboundedSender<OpenStatus>,
}

/// Requests waiting for the engine's answer, in the order they were made.
#[derive(Debug, Default)]
struct Waiting {
    listens: VecDeque<oneshot::Sender<bool>>,
    writes: VecDeque<oneshot::Sender<WriteReply>>,
    reads: VecDeque<(ReadRequest, oneshot::Sender<Vec<u8>>)>,
    /// Words of the read being received
    read_words: Vec<crate::wire::Word>,
}

/// A cloneable way to talk to a running engine.
#[derive(Debug, Clone)]
pub struct ToeHandle {
    instructions: mpsc::Sender<Instruction>,
}

impl ToeHandle {
    async fn send(&self, instruction: Instruction) -> Result<(), RuntimeError> {
        self.instructions
            .send(instruction)
            .await
            .map_err(|_| RuntimeError::Stopped)
    }

    /// Hands a received packet to the engine.
    pub async fn packet(&self, packet: RxPacket) -> Result<(), RuntimeError> {
        self.send(Instruction::Packet(packet)).await
    }

    /// Starts listening on `port`. Returns whether the port was accepted.
    pub async fn listen(&self, port: u16) -> Result<bool, RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Instruction::Listen { port, reply }).await?;
        answer.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Opens a connection. The result arrives on
    /// [`RuntimeOutputs::open_statuses`].
    pub async fn open(&self, remote: Endpoint) -> Result<(), RuntimeError> {
        self.send(Instruction::Open(remote)).await
    }

    pub async fn close(&self, session: SessionId) -> Result<(), RuntimeError> {
        self.send(Instruction::Close(session)).await
    }

    pub async fn write(&self, session: SessionId, data: Vec<u8>) -> Result<WriteReply, RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Instruction::Write {
            session,
            data,
            reply,
        })
        .await?;
        answer.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Reads `length` received bytes. The application should only ask for
    /// bytes it was notified about.
    pub async fn read(&self, session: SessionId, length: u32) -> Result<Vec<u8>, RuntimeError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let (reply, answer) = oneshot::channel();
        self.send(Instruction::Read {
            request: ReadRequest { session, length },
            reply,
        })
        .await?;
        answer.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Reports a segment sent by the segment builder.
    pub async fn report_sent(&self, sent: TxSent) -> Result<(), RuntimeError> {
        self.send(Instruction::Sent(sent)).await
    }

    pub async fn report_probe(&self, session: SessionId) -> Result<(), RuntimeError> {
        self.send(Instruction::Probe(session)).await
    }

    /// Stops the engine task once the instructions sent before are handled.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.send(Instruction::Shutdown).await
    }
}

/// An engine running in its own task.
#[derive(Debug)]
pub struct Runtime {
    handle: ToeHandle,
    task: JoinHandle<()>,
}

impl Runtime {
    /// Spawns the engine task. Every `tick`, the engine is stepped
    /// `steps_per_tick` times. Must be called from within a tokio runtime.
    pub fn start(
        config: ToeConfig,
        tick: Duration,
        steps_per_tick: usize,
    ) -> Result<(Self, RuntimeOutputs), RuntimeError> {
        let engine = Engine::new(config)?;
        let (instructions, receiver) = mpsc::channel(engine.config().queue_capacity);
        let (events, events_out) = mpsc::unbounded_channel();
        let (notifications, notifications_out) = mpsc::unbounded_channel();
        let (open_statuses, open_statuses_out) = mpsc::unbounded_channel();
        let senders = OutputSenders {
            events,
            notifications,
            open_statuses,
        };
        let task = tokio::spawn(run_engine(engine, receiver, senders, tick, steps_per_tick));
        let runtime = Self {
            handle: ToeHandle { instructions },
            task,
        };
        let outputs = RuntimeOutputs {
            events: events_out,
            notifications: notifications_out,
            open_statuses: open_statuses_out,
        };
        Ok((runtime, outputs))
    }

    pub fn handle(&self) -> ToeHandle {
        self.handle.clone()
    }

    /// Stops the engine and waits for its task to end.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        // The task may already be gone, which is what we want anyway
        let _ = self.handle.shutdown().await;
        self.task.await?;
        Ok(())
    }
}

async fn run_engine(
    mut engine: Engine,
    mut instructions: mpsc::Receiver<Instruction>,
    outputs: OutputSenders,
    tick: Duration,
    steps_per_tick: usize,
) {
    let mut interval = time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backlog = VecDeque::new();
    let mut waiting = Waiting::default();

    loop {
        tokio::select! {
            instruction = instructions.recv() => match instruction {
                Some(Instruction::Shutdown) | None => break,
                Some(instruction) => backlog.push_back(instruction),
            },
            _ = interval.tick() => {
                for _ in 0..steps_per_tick {
                    submit_backlog(&mut engine, &mut backlog, &mut waiting);
                    engine.step();
                    drain_outputs(&mut engine, &outputs, &mut waiting);
                }
            }
        }
    }

    // Work handed in before the shutdown is finished first
    for _ in 0..MAX_SHUTDOWN_STEPS {
        if backlog.is_empty() && engine.is_idle() {
            break;
        }
        submit_backlog(&mut engine, &mut backlog, &mut waiting);
        engine.step();
        drain_outputs(&mut engine, &outputs, &mut waiting);
    }
    tracing::info!(steps = engine.steps(), "Engine stopped");
}

/// Hands queued instructions to the engine until one does not fit.
fn submit_backlog(engine: &mut Engine, backlog: &mut VecDeque<Instruction>, waiting: &mut Waiting) {
    while let Some(instruction) = backlog.pop_front() {
        if let Err(instruction) = submit(engine, instruction, waiting) {
            backlog.push_front(instruction);
            break;
        }
    }
}

fn submit(
    engine: &mut Engine,
    instruction: Instruction,
    waiting: &mut Waiting,
) -> Result<(), Instruction> {
    let result: Result<(), SubmitError> = match &instruction {
        Instruction::Packet(packet) => engine.push_packet(packet.clone()),
        Instruction::Listen { port, .. } => engine.listen(*port),
        Instruction::Open(remote) => engine.open(*remote),
        Instruction::Close(session) => engine.close(*session),
        Instruction::Write { session, data, .. } => engine.write(*session, data),
        Instruction::Read { request, .. } => engine.push_read(*request),
        Instruction::Sent(sent) => engine.report_sent(*sent),
        Instruction::Probe(session) => engine.report_probe(*session),
        Instruction::Shutdown => Ok(()),
    };
    if result.is_err() {
        return Err(instruction);
    }
    match instruction {
        Instruction::Listen { reply, .. } => waiting.listens.push_back(reply),
        Instruction::Write { reply, .. } => waiting.writes.push_back(reply),
        Instruction::Read { request, reply } => waiting.reads.push_back((request, reply)),
        _ => {}
    }
    Ok(())
}

fn drain_outputs(engine: &mut Engine, outputs: &OutputSenders, waiting: &mut Waiting) {
    // Receivers that were dropped simply stop getting output
    while let Some(event) = engine.pop_event() {
        let _ = outputs.events.send(event);
    }
    while let Some(notification) = engine.pop_notification() {
        let _ = outputs.notifications.send(notification);
    }
    while let Some(status) = engine.pop_open_status() {
        let _ = outputs.open_statuses.send(status);
    }
    while let Some(reply) = engine.pop_listen_reply() {
        if let Some(waiter) = waiting.listens.pop_front() {
            let _ = waiter.send(reply.accepted);
        }
    }
    while let Some(reply) = engine.pop_write_reply() {
        if let Some(waiter) = waiting.writes.pop_front() {
            let _ = waiter.send(reply);
        }
    }
    while engine.pop_read_session().is_some() {}
    while let Some(word) = engine.pop_read_data() {
        let last = word.last;
        waiting.read_words.push(word);
        if last {
            let data = from_words(&waiting.read_words);
            waiting.read_words.clear();
            if let Some((_, waiter)) = waiting.reads.pop_front() {
                let _ = waiter.send(data);
            }
        }
    }
}

//! The sync engine: a single task that owns the visible message list and
//! the open remote stream.
//!
//! Asynchronous work is tagged with the connectivity epoch it started under
//! and reports back through the engine's own channels. State is only mutated
//! on the engine task, and results from an older epoch are recognised there.

use crate::chat::cache::{self, LocalCache};
use crate::chat::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::chat::dispatcher::{DispatchOutcome, FlushReport, OutboundDispatcher};
use crate::chat::remote::{RemoteCollection, RemoteMessageStream, StreamEvent, StreamHandle};
use crate::chat::types::{ConversationSnapshot, Message, MessageId, Sender, ENTERED_CHAT_NOTICE};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Coarse lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Offline; showing the cached conversation.
    Disconnected,
    /// Online, waiting for the first remote snapshot.
    Connecting,
    /// Online and live.
    Connected,
}

/// Events emitted by the engine for UI notification.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The visible message list was replaced.
    MessagesChanged(ConversationSnapshot),
    /// A connectivity transition was applied.
    ConnectivityChanged { connected: bool },
    /// Engine lifecycle changed.
    StateChanged(EngineState),
    /// A message could not be written and was queued.
    DispatchFailed { message_id: MessageId, reason: String },
    /// The outbox was replayed after reconnecting.
    OutboxFlushed { sent: usize, requeued: usize },
}

enum Command {
    Send {
        message: Message,
        reply: oneshot::Sender<Result<DispatchOutcome>>,
    },
    Stop,
}

enum Completion {
    Dispatched {
        epoch: u64,
        message: Message,
        result: Result<DispatchOutcome>,
        reply: oneshot::Sender<Result<DispatchOutcome>>,
    },
    Flushed {
        epoch: u64,
        report: FlushReport,
    },
}

/// Wiring for a chat session. Call [`start`](Self::start) to run it.
pub struct SyncEngine {
    monitor: ConnectivityMonitor,
    remote: Arc<dyn RemoteCollection>,
    cache: Arc<dyn LocalCache>,
    assistant: Sender,
}

impl SyncEngine {
    pub fn new(
        monitor: ConnectivityMonitor,
        remote: Arc<dyn RemoteCollection>,
        cache: Arc<dyn LocalCache>,
        assistant: Sender,
    ) -> Self {
        Self {
            monitor,
            remote,
            cache,
            assistant,
        }
    }

    /// Spawn the engine task. Must be called from within a Tokio runtime.
    pub fn start(self) -> SyncHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ConversationSnapshot::empty());
        let (state_tx, state_rx) = watch::channel(EngineState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let dispatcher = Arc::new(OutboundDispatcher::new(
            self.remote.clone(),
            self.cache.clone(),
            self.assistant,
        ));

        let runner = EngineLoop {
            stream: RemoteMessageStream::new(self.remote),
            cache: self.cache,
            dispatcher,
            connectivity: None,
            state: EngineState::Disconnected,
            handle: None,
            messages: ConversationSnapshot::empty(),
            session_started: false,
            stream_tx,
            completion_tx,
            view_tx,
            state_tx,
            events_tx: events_tx.clone(),
        };

        let monitor = self.monitor;
        let task = tokio::spawn(async move {
            runner.run(monitor, command_rx, stream_rx, completion_rx).await;
        });

        SyncHandle {
            commands: command_tx,
            view: view_rx,
            state: state_rx,
            events: events_tx,
            task,
        }
    }
}

/// Presentation-side access to a running engine.
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ConversationSnapshot>,
    state: watch::Receiver<EngineState>,
    events: broadcast::Sender<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// The list currently shown, newest first.
    pub fn current_messages(&self) -> ConversationSnapshot {
        self.view.borrow().clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that is updated whenever the visible list changes.
    pub fn watch_messages(&self) -> watch::Receiver<ConversationSnapshot> {
        self.view.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Send a message. When this returns, the visible list already reflects
    /// any local changes the send caused.
    pub async fn send(&self, message: Message) -> Result<DispatchOutcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { message, reply: tx })
            .await
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Stop the engine and wait for it to release its resources.
    pub async fn stop(self) -> Result<()> {
        // A closed channel means the task is already finishing.
        let _ = self.commands.send(Command::Stop).await;
        self.task
            .await
            .map_err(|e| Error::Io(format!("sync engine task failed: {}", e)))
    }
}

struct EngineLoop {
    stream: RemoteMessageStream,
    cache: Arc<dyn LocalCache>,
    dispatcher: Arc<OutboundDispatcher>,
    connectivity: Option<ConnectivityState>,
    state: EngineState,
    handle: Option<StreamHandle>,
    messages: ConversationSnapshot,
    /// Whether the entered-chat notice has been shown.
    session_started: bool,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    view_tx: watch::Sender<ConversationSnapshot>,
    state_tx: watch::Sender<EngineState>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl EngineLoop {
    async fn run(
        mut self,
        monitor: ConnectivityMonitor,
        mut commands: mpsc::Receiver<Command>,
        mut stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
        mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut subscription = monitor.subscribe();
        let mut watching = true;
        info!("Sync engine started");

        loop {
            tokio::select! {
                next = subscription.next(), if watching => match next {
                    Some(state) => self.on_connectivity(state),
                    None => {
                        warn!("Connectivity signal ended; keeping last known state");
                        watching = false;
                    }
                },
                Some(event) = stream_rx.recv() => self.on_stream_event(event),
                Some(done) = completion_rx.recv() => self.on_completion(done),
                command = commands.recv() => match command {
                    Some(Command::Send { message, reply }) => self.on_send(message, reply),
                    Some(Command::Stop) | None => break,
                },
            }
        }

        subscription.unsubscribe();
        self.close_stream();
        info!("Sync engine stopped");
    }

    fn epoch(&self) -> u64 {
        self.connectivity.map(|c| c.transition).unwrap_or(0)
    }

    fn is_connected(&self) -> bool {
        self.connectivity.map(|c| c.connected).unwrap_or(false)
    }

    fn on_connectivity(&mut self, state: ConnectivityState) {
        if self.connectivity.map(|c| c.connected) == Some(state.connected) {
            debug!("Ignoring repeated connectivity state {}", state.connected);
            return;
        }

        self.connectivity = Some(state);
        info!(
            "Connectivity changed: connected={} (transition {})",
            state.connected, state.transition
        );
        self.emit(SyncEvent::ConnectivityChanged {
            connected: state.connected,
        });

        // Any stream from an earlier epoch is stale now.
        self.close_stream();

        if state.connected {
            self.set_state(EngineState::Connecting);
            match self.stream.open(state, self.stream_tx.clone()) {
                Ok(handle) => self.handle = Some(handle),
                Err(e) => {
                    warn!("Failed to open remote stream: {}", e);
                    self.show_offline_view();
                }
            }
        } else {
            self.set_state(EngineState::Disconnected);
            self.show_offline_view();
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        let current = self.handle.as_ref().map(StreamHandle::epoch);
        if current != Some(event.epoch()) || event.epoch() != self.epoch() {
            debug!("Discarding stream event from stale epoch {}", event.epoch());
            return;
        }

        match event {
            StreamEvent::Snapshot { snapshot, .. } => self.on_snapshot(snapshot),
            StreamEvent::Failed { error, .. } => {
                warn!("Remote stream failed: {}", error);
                self.close_stream();
                if self.messages.is_empty() {
                    self.show_offline_view();
                }
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: ConversationSnapshot) {
        let first = self.state != EngineState::Connected;
        let delivered = snapshot.ids();

        self.messages = if first && !self.session_started {
            self.session_started = true;
            snapshot.merged([Message::system_notice(ENTERED_CHAT_NOTICE)])
        } else {
            snapshot
        };
        cache::save_or_log(self.cache.as_ref(), &self.messages);
        self.publish();
        self.set_state(EngineState::Connected);

        if first {
            self.start_flush(delivered);
        }
    }

    fn on_send(&mut self, message: Message, reply: oneshot::Sender<Result<DispatchOutcome>>) {
        if let Err(e) = message.validate() {
            let _ = reply.send(Err(e));
            return;
        }

        let connectivity = self.connectivity.unwrap_or(ConnectivityState {
            connected: false,
            transition: 0,
        });
        if !connectivity.connected {
            self.messages = self.messages.merged([message.clone()]);
            self.publish();
        }

        let dispatcher = self.dispatcher.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(&message, connectivity).await;
            let _ = completions.send(Completion::Dispatched {
                epoch: connectivity.transition,
                message,
                result,
                reply,
            });
        });
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Dispatched {
                epoch,
                message,
                result,
                reply,
            } => {
                let pending = match &result {
                    Ok(DispatchOutcome::Queued { .. }) => true,
                    Err(Error::DispatchFailed(reason)) => {
                        self.emit(SyncEvent::DispatchFailed {
                            message_id: message.id.clone(),
                            reason: reason.clone(),
                        });
                        true
                    }
                    _ => false,
                };
                // Keep the outboxed message visible until a snapshot replaces the list.
                if pending && epoch == self.epoch() {
                    if !self.messages.contains(&message.id) {
                        self.messages = self.messages.merged([message]);
                        self.publish();
                    }
                } else if pending && !self.is_connected() {
                    self.show_offline_view();
                }
                let _ = reply.send(result);
            }
            Completion::Flushed { epoch, report } => {
                self.emit(SyncEvent::OutboxFlushed {
                    sent: report.sent.len(),
                    requeued: report.requeued,
                });
                if epoch != self.epoch() && !self.is_connected() {
                    // Requeued entries belong in the offline view.
                    self.show_offline_view();
                }
            }
        }
    }

    fn start_flush(&self, delivered: HashSet<MessageId>) {
        if cache::pending_or_empty(self.cache.as_ref()).is_empty() {
            return;
        }

        let epoch = self.epoch();
        let dispatcher = self.dispatcher.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let report = dispatcher.flush_outbox(&delivered).await;
            let _ = completions.send(Completion::Flushed { epoch, report });
        });
    }

    fn show_offline_view(&mut self) {
        self.messages = cache::offline_view(self.cache.as_ref());
        self.publish();
    }

    fn close_stream(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.messages.clone());
        self.emit(SyncEvent::MessagesChanged(self.messages.clone()));
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            self.state = state;
            self.state_tx.send_replace(state);
            self.emit(SyncEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events_tx.send(event);
    }
}

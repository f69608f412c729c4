//! Tokio event loop around [`ConnectionOrchestrator`].
//!
//! The orchestrator is single-threaded and synchronous. The [`Driver`] owns it
//! on a current-thread runtime and feeds it from three sources:
//!
//! - relay socket events (opened, frame, closed),
//! - negotiation tasks spawned through a [`MeshConnector`], tagged with the
//!   link generation they were started for,
//! - commands posted through a [`DriverHandle`].
//!
//! Between inputs it sleeps until the orchestrator's next deadline, or not at
//! all while relay messages are still queued.
//!
//! `run` spawns with [`tokio::task::spawn_local`], so it must be awaited
//! inside a [`tokio::task::LocalSet`].

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use meshsync_core::{IceCredentials, Millis, PeerId, SignalPayload};
use meshsync_transport::{CandidateType, DataChannel, NegotiationRequest, RelaySocket};

use crate::error::{MeshsyncError, Result};
use crate::orchestrator::{ConnectionOrchestrator, NegotiationCommand};

/// Upper bound on a single idle sleep.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// What a relay socket implementation reports back to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaySocketEvent {
    Opened,
    Frame(String),
    Closed,
}

/// What an open data channel reports back to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    Text(String),
    /// The remote side went away.
    Closed,
    Error,
}

/// Signalling pipes handed to one negotiation.
pub struct SignalChannel {
    /// Signals relayed from the remote peer.
    pub inbound: mpsc::UnboundedReceiver<SignalPayload>,
    /// Signals to relay to the remote peer.
    pub outbound: mpsc::UnboundedSender<SignalPayload>,
}

/// A successfully negotiated data channel.
pub struct NegotiatedLink {
    pub channel: Box<dyn DataChannel>,
    pub candidate: Option<CandidateType>,
    /// Frames and lifecycle changes from the channel.
    pub inbound: mpsc::UnboundedReceiver<ChannelInput>,
}

/// The platform's link negotiation primitive (e.g. a WebRTC stack).
#[async_trait(?Send)]
pub trait MeshConnector {
    /// Negotiate the link described by `request`. An error counts as a failed
    /// negotiation for that generation.
    async fn negotiate(
        &self,
        request: NegotiationRequest,
        credentials: Option<IceCredentials>,
        signals: SignalChannel,
    ) -> Result<NegotiatedLink>;
}

type Command<S> = Box<dyn FnOnce(&mut ConnectionOrchestrator<S>, Millis)>;

enum LoopInput<S: RelaySocket> {
    Negotiated {
        peer_id: PeerId,
        generation: u64,
        result: Result<(Box<dyn DataChannel>, Option<CandidateType>)>,
    },
    Channel {
        peer_id: PeerId,
        generation: u64,
        input: ChannelInput,
    },
    Signal {
        peer_id: PeerId,
        generation: u64,
        signal: SignalPayload,
    },
    Command(Command<S>),
    Shutdown,
}

/// Posts work onto a running [`Driver`].
pub struct DriverHandle<S: RelaySocket> {
    tx: mpsc::UnboundedSender<LoopInput<S>>,
}

impl<S: RelaySocket> Clone for DriverHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: RelaySocket> DriverHandle<S> {
    /// Run `f` on the loop with the current time.
    pub fn command(
        &self,
        f: impl FnOnce(&mut ConnectionOrchestrator<S>, Millis) + 'static,
    ) -> Result<()> {
        self.tx
            .send(LoopInput::Command(Box::new(f)))
            .map_err(|_| MeshsyncError::DriverStopped)
    }

    pub fn connect(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        self.command(move |o, now| o.connect(&url, now))
    }

    pub fn logout(&self) -> Result<()> {
        self.command(|o, now| o.logout(now))
    }

    /// Stop the loop after the inputs already queued.
    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(LoopInput::Shutdown)
            .map_err(|_| MeshsyncError::DriverStopped)
    }
}

struct Negotiation {
    generation: u64,
    signals: mpsc::UnboundedSender<SignalPayload>,
    task: JoinHandle<()>,
}

/// Owns the orchestrator and its clock.
pub struct Driver<S: RelaySocket + 'static, C: MeshConnector + 'static> {
    orchestrator: ConnectionOrchestrator<S>,
    connector: Rc<C>,
    relay_events: mpsc::UnboundedReceiver<RelaySocketEvent>,
    tx: mpsc::UnboundedSender<LoopInput<S>>,
    rx: mpsc::UnboundedReceiver<LoopInput<S>>,
    negotiations: HashMap<PeerId, Negotiation>,
    /// Remote signals that arrived before their negotiation started.
    early_signals: HashMap<PeerId, (u64, Vec<SignalPayload>)>,
    epoch: Instant,
}

impl<S: RelaySocket + 'static, C: MeshConnector + 'static> Driver<S, C> {
    pub fn new(
        orchestrator: ConnectionOrchestrator<S>,
        relay_events: mpsc::UnboundedReceiver<RelaySocketEvent>,
        connector: C,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            orchestrator,
            connector: Rc::new(connector),
            relay_events,
            tx,
            rx,
            negotiations: HashMap::new(),
            early_signals: HashMap::new(),
            epoch: Instant::now(),
        }
    }

    pub fn handle(&self) -> DriverHandle<S> {
        DriverHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn orchestrator(&self) -> &ConnectionOrchestrator<S> {
        &self.orchestrator
    }

    /// For wiring subscribers and hooks before `run`.
    pub fn orchestrator_mut(&mut self) -> &mut ConnectionOrchestrator<S> {
        &mut self.orchestrator
    }

    /// Milliseconds since the driver was created.
    pub fn now(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis
    }

    /// Run until [`DriverHandle::shutdown`]. Returns the orchestrator.
    pub async fn run(mut self) -> ConnectionOrchestrator<S> {
        info!("session driver started");
        loop {
            self.dispatch_commands();

            let wake = self.wake_at();
            tokio::select! {
                Some(event) = self.relay_events.recv() => {
                    let now = self.now();
                    match event {
                        RelaySocketEvent::Opened => self.orchestrator.on_relay_open(now),
                        RelaySocketEvent::Frame(text) => {
                            self.orchestrator.on_relay_frame(&text, now)
                        }
                        RelaySocketEvent::Closed => self.orchestrator.on_relay_close(now),
                    }
                }
                Some(input) = self.rx.recv() => {
                    if matches!(input, LoopInput::Shutdown) {
                        break;
                    }
                    self.on_input(input);
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            let now = self.now();
            self.orchestrator.tick(now);
        }

        for (_, negotiation) in self.negotiations.drain() {
            negotiation.task.abort();
        }
        info!("session driver stopped");
        self.orchestrator
    }

    fn wake_at(&self) -> Instant {
        if self.orchestrator.has_queued_messages() {
            return Instant::now();
        }
        let idle = Instant::now() + MAX_IDLE;
        match self.orchestrator.next_deadline() {
            Some(deadline) => (self.epoch + Duration::from_millis(deadline)).min(idle),
            None => idle,
        }
    }

    fn on_input(&mut self, input: LoopInput<S>) {
        let now = self.now();
        match input {
            LoopInput::Negotiated {
                peer_id,
                generation,
                result,
            } => match result {
                Ok((channel, candidate)) => {
                    self.orchestrator
                        .on_link_open(&peer_id, generation, channel, candidate, now)
                }
                Err(e) => {
                    debug!(peer = %peer_id, generation, "negotiation failed: {}", e);
                    if self
                        .negotiations
                        .get(&peer_id)
                        .is_some_and(|n| n.generation == generation)
                    {
                        self.negotiations.remove(&peer_id);
                    }
                    self.orchestrator
                        .on_negotiation_failed(&peer_id, generation, now)
                }
            },
            LoopInput::Channel {
                peer_id,
                generation,
                input,
            } => match input {
                ChannelInput::Text(text) => {
                    self.orchestrator
                        .on_link_data(&peer_id, generation, &text, now)
                }
                ChannelInput::Closed => {
                    self.orchestrator
                        .on_link_disconnected(&peer_id, generation, now)
                }
                ChannelInput::Error => self.orchestrator.on_link_error(&peer_id, generation, now),
            },
            LoopInput::Signal {
                peer_id,
                generation,
                signal,
            } => {
                self.orchestrator.send_signal(&peer_id, generation, signal);
            }
            LoopInput::Command(f) => f(&mut self.orchestrator, now),
            LoopInput::Shutdown => {}
        }
    }

    fn dispatch_commands(&mut self) {
        for command in self.orchestrator.take_commands() {
            match command {
                NegotiationCommand::Start {
                    request,
                    credentials,
                } => self.start_negotiation(request, credentials),
                NegotiationCommand::RemoteSignal {
                    peer_id,
                    generation,
                    signal,
                } => match self.negotiations.get(&peer_id) {
                    Some(n) if n.generation == generation => {
                        if n.signals.send(signal).is_err() {
                            trace!(peer = %peer_id, "negotiation no longer reading signals");
                        }
                    }
                    _ => {
                        let entry = self
                            .early_signals
                            .entry(peer_id)
                            .or_insert_with(|| (generation, Vec::new()));
                        if entry.0 != generation {
                            *entry = (generation, Vec::new());
                        }
                        entry.1.push(signal);
                    }
                },
                NegotiationCommand::Abandon { peer_id } => {
                    self.early_signals.remove(&peer_id);
                    if let Some(negotiation) = self.negotiations.remove(&peer_id) {
                        debug!(
                            peer = %peer_id,
                            generation = negotiation.generation,
                            "negotiation abandoned"
                        );
                        negotiation.task.abort();
                    }
                }
            }
        }
    }

    fn start_negotiation(
        &mut self,
        request: NegotiationRequest,
        credentials: Option<IceCredentials>,
    ) {
        let peer_id = request.peer_id.clone();
        let generation = request.generation;
        if let Some(previous) = self.negotiations.remove(&peer_id) {
            previous.task.abort();
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        if let Some((early_generation, signals)) = self.early_signals.remove(&peer_id) {
            if early_generation == generation {
                for signal in signals {
                    let _ = signal_tx.send(signal);
                }
            }
        }

        let connector = Rc::clone(&self.connector);
        let tx = self.tx.clone();
        let task_peer = peer_id.clone();
        let task = tokio::task::spawn_local(async move {
            negotiate_and_pump(
                connector,
                request,
                credentials,
                signal_rx,
                tx,
                task_peer,
                generation,
            )
            .await
        });

        debug!(peer = %peer_id, generation, "negotiation started");
        self.negotiations.insert(
            peer_id,
            Negotiation {
                generation,
                signals: signal_tx,
                task,
            },
        );
    }
}

async fn negotiate_and_pump<S: RelaySocket, C: MeshConnector>(
    connector: Rc<C>,
    request: NegotiationRequest,
    credentials: Option<IceCredentials>,
    inbound: mpsc::UnboundedReceiver<SignalPayload>,
    tx: mpsc::UnboundedSender<LoopInput<S>>,
    peer_id: PeerId,
    generation: u64,
) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let signals = SignalChannel { inbound, outbound };
    let negotiation = connector.negotiate(request, credentials, signals);
    tokio::pin!(negotiation);

    let forward = |signal: SignalPayload| {
        let _ = tx.send(LoopInput::Signal {
            peer_id: peer_id.clone(),
            generation,
            signal,
        });
    };

    let result = loop {
        tokio::select! {
            result = &mut negotiation => break result,
            Some(signal) = outbound_rx.recv() => forward(signal),
        }
    };
    while let Ok(signal) = outbound_rx.try_recv() {
        forward(signal);
    }

    let link = match result {
        Ok(link) => link,
        Err(e) => {
            let _ = tx.send(LoopInput::Negotiated {
                peer_id,
                generation,
                result: Err(e),
            });
            return;
        }
    };

    let NegotiatedLink {
        channel,
        candidate,
        mut inbound,
    } = link;
    if tx
        .send(LoopInput::Negotiated {
            peer_id: peer_id.clone(),
            generation,
            result: Ok((channel, candidate)),
        })
        .is_err()
    {
        return;
    }

    while let Some(input) = inbound.recv().await {
        let done = !matches!(input, ChannelInput::Text(_));
        if tx
            .send(LoopInput::Channel {
                peer_id: peer_id.clone(),
                generation,
                input,
            })
            .is_err()
            || done
        {
            return;
        }
    }
    warn!(peer = %peer_id, generation, "data channel input ended without close");
    let _ = tx.send(LoopInput::Channel {
        peer_id,
        generation,
        input: ChannelInput::Closed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshsyncConfig;
    use crate::events::{SessionEvent, SessionEventKind};
    use meshsync_core::{encode_frame, RelayMessage};
    use meshsync_transport::{Fingerprint, MemoryDataChannel, MemoryRelaySocket};
    use std::cell::RefCell;
    use tokio::task::LocalSet;

    /// Opens every link immediately and hands the test the inbound sender.
    #[derive(Default)]
    struct InstantConnector {
        channels: RefCell<Vec<(PeerId, MemoryDataChannel, mpsc::UnboundedSender<ChannelInput>)>>,
    }

    #[async_trait(?Send)]
    impl MeshConnector for InstantConnector {
        async fn negotiate(
            &self,
            request: NegotiationRequest,
            _credentials: Option<IceCredentials>,
            signals: SignalChannel,
        ) -> Result<NegotiatedLink> {
            let _ = signals.outbound.send(SignalPayload::Offer { sdp: "v=0".into() });
            let channel = MemoryDataChannel::new();
            let (tx, inbound) = mpsc::unbounded_channel();
            self.channels
                .borrow_mut()
                .push((request.peer_id.clone(), channel.clone(), tx));
            Ok(NegotiatedLink {
                channel: Box::new(channel),
                candidate: Some(CandidateType::Host),
                inbound,
            })
        }
    }

    struct FailingConnector;

    #[async_trait(?Send)]
    impl MeshConnector for FailingConnector {
        async fn negotiate(
            &self,
            _request: NegotiationRequest,
            _credentials: Option<IceCredentials>,
            _signals: SignalChannel,
        ) -> Result<NegotiatedLink> {
            Err(MeshsyncError::Config("no route".into()))
        }
    }

    fn frame(message: &RelayMessage) -> RelaySocketEvent {
        RelaySocketEvent::Frame(encode_frame(message).unwrap())
    }

    fn orchestrator(socket: &MemoryRelaySocket) -> ConnectionOrchestrator<MemoryRelaySocket> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        ConnectionOrchestrator::with_jitter(
            socket.clone(),
            Fingerprint::derive_with_salt(&["driver"], b"salt"),
            MeshsyncConfig::default(),
            0,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_opens_links_from_proximity() {
        LocalSet::new()
            .run_until(async {
                let socket = MemoryRelaySocket::new();
                let (relay_tx, relay_rx) = mpsc::unbounded_channel();
                let mut driver =
                    Driver::new(orchestrator(&socket), relay_rx, InstantConnector::default());
                let connected = Rc::new(RefCell::new(Vec::new()));
                let sink = connected.clone();
                driver
                    .orchestrator_mut()
                    .events()
                    .subscribe_kind(SessionEventKind::PeerConnected, move |e| {
                        sink.borrow_mut().push(e.clone())
                    });
                let handle = driver.handle();
                let task = tokio::task::spawn_local(driver.run());

                handle.connect("ws://relay.test").unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                relay_tx.send(RelaySocketEvent::Opened).unwrap();
                relay_tx
                    .send(frame(&RelayMessage::Welcome { client_id: PeerId::from("1") }))
                    .unwrap();
                relay_tx
                    .send(frame(&RelayMessage::Proximity { nearby: vec![PeerId::from("2")] }))
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;

                handle.shutdown().unwrap();
                let orchestrator = task.await.unwrap();

                assert_eq!(
                    connected.borrow().as_slice(),
                    &[SessionEvent::PeerConnected {
                        peer_id: PeerId::from("2"),
                        candidate: Some(CandidateType::Host),
                    }]
                );
                assert!(orchestrator.mesh().link(&PeerId::from("2")).unwrap().is_open());
                // The connector's offer went out through the relay.
                assert!(socket.sent().iter().any(|f| f.contains("\"offer\"")));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_retries_failed_negotiation() {
        LocalSet::new()
            .run_until(async {
                let socket = MemoryRelaySocket::new();
                let (relay_tx, relay_rx) = mpsc::unbounded_channel();
                let driver = Driver::new(orchestrator(&socket), relay_rx, FailingConnector);
                let handle = driver.handle();
                let task = tokio::task::spawn_local(driver.run());

                handle.connect("ws://relay.test").unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                relay_tx.send(RelaySocketEvent::Opened).unwrap();
                relay_tx
                    .send(frame(&RelayMessage::Welcome { client_id: PeerId::from("1") }))
                    .unwrap();
                relay_tx
                    .send(frame(&RelayMessage::Proximity { nearby: vec![PeerId::from("2")] }))
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;

                handle.shutdown().unwrap();
                let orchestrator = task.await.unwrap();
                assert_eq!(orchestrator.retry_attempts(&PeerId::from("2")), 1);
                assert!(orchestrator.has_pending_retry(&PeerId::from("2")));
            })
            .await;
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        LocalSet::new()
            .run_until(async {
                let (_relay_tx, relay_rx) = mpsc::unbounded_channel();
                let socket = MemoryRelaySocket::new();
                let driver = Driver::new(orchestrator(&socket), relay_rx, FailingConnector);
                let handle = driver.handle();
                handle.shutdown().unwrap();
                let orchestrator = driver.run().await;
                assert!(!orchestrator.relay().is_open());
                // The loop's receiver is gone once `run` returns.
                assert!(matches!(handle.logout(), Err(MeshsyncError::DriverStopped)));
            })
            .await;
    }
}

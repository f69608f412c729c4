//! Relay socket over a websocket, using tokio-tungstenite.
//!
//! `open` spawns a local task that connects, then splits the stream: a writer
//! fed from an unbounded queue and a reader that reports frames to the
//! [`Driver`](crate::driver::Driver) as [`RelaySocketEvent`]s. Each `open`
//! starts a new connection epoch; tasks from an older epoch report nothing.
//!
//! Must be used from inside a [`tokio::task::LocalSet`].

use std::cell::Cell;
use std::rc::Rc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use meshsync_transport::{RelaySocket, TransportError};

use crate::driver::RelaySocketEvent;

pub struct WebSocketRelaySocket {
    events: mpsc::UnboundedSender<RelaySocketEvent>,
    epoch: Rc<Cell<u64>>,
    writer: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketRelaySocket {
    /// Create the socket and the receiver the driver reads events from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelaySocketEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let socket = Self {
            events,
            epoch: Rc::new(Cell::new(0)),
            writer: None,
            task: None,
        };
        (socket, rx)
    }

    fn shutdown(&mut self) {
        self.epoch.set(self.epoch.get() + 1);
        self.writer = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RelaySocket for WebSocketRelaySocket {
    fn open(&mut self, url: &str) -> meshsync_transport::Result<()> {
        self.shutdown();
        let epoch = self.epoch.get();
        let current = Rc::clone(&self.epoch);
        let events = self.events.clone();
        let (writer, mut outgoing) = mpsc::unbounded_channel::<String>();
        self.writer = Some(writer);

        let url = url.to_string();
        let task = tokio::task::spawn_local(async move {
            let report = |event: RelaySocketEvent| {
                if current.get() == epoch {
                    let _ = events.send(event);
                }
            };

            let stream = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    warn!("relay websocket connect failed: {}", e);
                    report(RelaySocketEvent::Closed);
                    return;
                }
            };
            report(RelaySocketEvent::Opened);

            let (mut sink, mut stream) = stream.split();
            loop {
                tokio::select! {
                    frame = outgoing.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!("relay websocket send failed: {}", e);
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            return;
                        }
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => report(RelaySocketEvent::Frame(text)),
                        Some(Ok(Message::Binary(_))) => debug!("ignoring binary relay frame"),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("relay websocket read failed: {}", e);
                            break;
                        }
                    },
                }
            }
            report(RelaySocketEvent::Closed);
        });
        self.task = Some(task);
        Ok(())
    }

    fn send_text(&mut self, frame: &str) -> meshsync_transport::Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| TransportError::Socket("relay websocket not open".into()))?;
        writer
            .send(frame.to_string())
            .map_err(|_| TransportError::Socket("relay websocket writer gone".into()))
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

impl Drop for WebSocketRelaySocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! The authoritative relay connection.
//!
//! Lifecycle:
//!
//! ```text
//!  Idle ──connect──► Connecting ──on_open──► AwaitingWelcome ──welcome──► Open
//!                        ▲                        │   │                    │
//!                        │                rejected│   └──close/silence─────┤
//!                        │                        ▼                        ▼
//!                        └──reconnect timer── WaitingToReconnect ◄─────────┘
//!                                                 │ attempts exhausted
//!                                                 ▼
//!                                              Failed
//! ```
//!
//! The first frame on every connection is the session fingerprint. Nothing
//! else is sent until the relay answers with `welcome`.

use meshsync_core::{
    decode_frame, encode_frame, ClientMessage, Millis, PeerId, RelayMessage, TimerQueue,
};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::TransportError;
use crate::fingerprint::Fingerprint;
use crate::socket::RelaySocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Never connected, or intentionally disconnected.
    Idle,
    Connecting,
    /// Socket open, fingerprint sent, welcome pending.
    AwaitingWelcome,
    Open,
    WaitingToReconnect,
    /// Rejected by the relay or out of reconnect attempts.
    Failed,
}

/// Notifications produced by the relay transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The relay accepted the handshake.
    Connected { client_id: PeerId },
    /// An application frame from the relay.
    Message(RelayMessage),
    /// An open session was lost unexpectedly.
    Disconnected,
    ReconnectScheduled { attempt: u32, max: u32 },
    /// The relay will not be retried. Deliberately carries no reason.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayTimer {
    Reconnect,
    Watchdog,
    Ping,
}

/// Single connection to the relay.
pub struct ReliableChannelTransport<S: RelaySocket> {
    socket: S,
    config: RelayConfig,
    fingerprint: Fingerprint,
    url: Option<String>,
    state: RelayState,
    client_id: Option<PeerId>,
    /// Consecutive failed attempts since the last welcome.
    attempts: u32,
    /// Set by an intentional disconnect until the next connect.
    suppress_failures: bool,
    last_message_at: Millis,
    timers: TimerQueue<RelayTimer>,
}

impl<S: RelaySocket> ReliableChannelTransport<S> {
    pub fn new(socket: S, fingerprint: Fingerprint, config: RelayConfig) -> Self {
        Self {
            socket,
            config,
            fingerprint,
            url: None,
            state: RelayState::Idle,
            client_id: None,
            attempts: 0,
            suppress_failures: false,
            last_message_at: 0,
            timers: TimerQueue::new(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Whether application frames can be sent.
    pub fn is_open(&self) -> bool {
        self.state == RelayState::Open
    }

    /// Identity assigned by the relay for the current session.
    pub fn client_id(&self) -> Option<&PeerId> {
        self.client_id.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn last_message_at(&self) -> Millis {
        self.last_message_at
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            RelayState::Connecting | RelayState::AwaitingWelcome | RelayState::Open
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Open the relay connection, replacing any current one.
    pub fn connect(&mut self, url: &str, now: Millis) -> Vec<RelayEvent> {
        self.url = Some(url.to_string());
        self.suppress_failures = false;
        self.timers.clear();
        if self.is_active() {
            self.state = RelayState::Idle;
            self.socket.close();
        }
        self.open_socket(now)
    }

    /// Write one frame. Returns whether it was actually handed to the socket;
    /// false whenever the session is not open.
    pub fn send(&mut self, message: &ClientMessage) -> bool {
        if self.state != RelayState::Open {
            return false;
        }
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode relay frame: {}", e);
                return false;
            }
        };
        match self.socket.send_text(&frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("relay send failed: {}", e);
                false
            }
        }
    }

    /// Close the connection.
    ///
    /// An intentional disconnect silences every later failure notification
    /// until the next `connect`. A non-intentional one is handled like any
    /// other unexpected close.
    pub fn disconnect(&mut self, intentional: bool, now: Millis) -> Vec<RelayEvent> {
        if intentional {
            debug!("relay disconnect (intentional)");
            self.suppress_failures = true;
            self.timers.clear();
            if self.is_active() {
                self.socket.close();
            }
            self.state = RelayState::Idle;
            self.client_id = None;
            return Vec::new();
        }
        if !self.is_active() {
            return Vec::new();
        }
        self.socket.close();
        self.on_close(now)
    }

    /// Manual reconnect: resets the attempt counter and connects immediately.
    pub fn reconnect_now(&mut self, now: Millis) -> Vec<RelayEvent> {
        info!("manual relay reconnect");
        self.attempts = 0;
        self.suppress_failures = false;
        self.timers.clear();
        if self.is_active() {
            self.state = RelayState::Idle;
            self.socket.close();
        }
        self.open_socket(now)
    }

    /// The host regained visibility, focus, or resumed from suspension.
    ///
    /// Timers may have been throttled while in the background, so silence
    /// measured across that period is not evidence of a dead connection.
    pub fn on_foreground(&mut self, now: Millis) {
        if self.is_active() {
            self.last_message_at = now;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Socket callbacks
    // ─────────────────────────────────────────────────────────────────────────

    /// The socket finished opening: send the fingerprint pre-handshake.
    pub fn on_open(&mut self, now: Millis) -> Vec<RelayEvent> {
        if self.state != RelayState::Connecting {
            debug!("ignoring open callback in state {:?}", self.state);
            return Vec::new();
        }

        let handshake = ClientMessage::Fingerprint {
            fingerprint: self.fingerprint.as_str().to_string(),
        };
        let sent = encode_frame(&handshake)
            .map_err(TransportError::from)
            .and_then(|frame| self.socket.send_text(&frame));
        if let Err(e) = sent {
            warn!("failed to send relay handshake: {}", e);
            self.socket.close();
            return self.on_close(now);
        }

        self.state = RelayState::AwaitingWelcome;
        self.last_message_at = now;
        self.arm(now, RelayTimer::Watchdog);
        Vec::new()
    }

    /// One text frame arrived.
    pub fn on_frame(&mut self, text: &str, now: Millis) -> Vec<RelayEvent> {
        if !matches!(self.state, RelayState::AwaitingWelcome | RelayState::Open) {
            debug!("ignoring relay frame in state {:?}", self.state);
            return Vec::new();
        }
        self.last_message_at = now;

        let message: RelayMessage = match decode_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping relay frame: {}", e);
                return Vec::new();
            }
        };
        if let Err(reason) = message.validate_limits() {
            warn!("dropping relay frame: {}", reason);
            return Vec::new();
        }

        match (self.state, message) {
            (_, RelayMessage::Rejected { .. }) => {
                info!("relay rejected the session");
                self.fail_permanently()
            }
            (RelayState::AwaitingWelcome, RelayMessage::Welcome { client_id }) => {
                info!(client_id = %client_id, "relay session established");
                self.state = RelayState::Open;
                self.attempts = 0;
                self.client_id = Some(client_id.clone());
                self.arm(now, RelayTimer::Ping);
                vec![RelayEvent::Connected { client_id }]
            }
            (RelayState::AwaitingWelcome, _) => {
                warn!("dropping relay frame received before welcome");
                Vec::new()
            }
            (_, RelayMessage::Pong {}) => Vec::new(),
            (_, RelayMessage::Welcome { .. }) => {
                warn!("ignoring duplicate welcome");
                Vec::new()
            }
            (_, message) => vec![RelayEvent::Message(message)],
        }
    }

    /// The socket closed or errored.
    pub fn on_close(&mut self, now: Millis) -> Vec<RelayEvent> {
        if !self.is_active() {
            return Vec::new();
        }
        let was_open = self.state == RelayState::Open;
        self.timers
            .cancel_where(|t| matches!(t, RelayTimer::Watchdog | RelayTimer::Ping));
        self.client_id = None;

        if self.suppress_failures {
            self.state = RelayState::Idle;
            return Vec::new();
        }

        let mut events = Vec::new();
        if was_open {
            events.push(RelayEvent::Disconnected);
        }

        let max = self.config.max_reconnect_attempts;
        if self.attempts >= max {
            warn!(attempts = self.attempts, "relay reconnect attempts exhausted");
            self.state = RelayState::Failed;
            self.timers.clear();
            events.push(RelayEvent::Failed);
            return events;
        }

        self.attempts += 1;
        self.state = RelayState::WaitingToReconnect;
        self.timers
            .schedule(now + self.config.reconnect_interval_ms, RelayTimer::Reconnect);
        debug!(attempt = self.attempts, max, "relay reconnect scheduled");
        events.push(RelayEvent::ReconnectScheduled {
            attempt: self.attempts,
            max,
        });
        events
    }

    /// Run due timers.
    pub fn tick(&mut self, now: Millis) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        for (_, timer) in self.timers.pop_expired(now) {
            match timer {
                RelayTimer::Reconnect => {
                    if self.state == RelayState::WaitingToReconnect {
                        events.extend(self.open_socket(now));
                    }
                }
                RelayTimer::Watchdog => events.extend(self.check_liveness(now)),
                RelayTimer::Ping => self.send_ping(now),
            }
        }
        events
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn open_socket(&mut self, now: Millis) -> Vec<RelayEvent> {
        let Some(url) = self.url.clone() else {
            return Vec::new();
        };
        self.state = RelayState::Connecting;
        debug!(url = %url, attempt = self.attempts, "opening relay socket");
        match self.socket.open(&url) {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!("relay socket failed to open: {}", e);
                self.on_close(now)
            }
        }
    }

    fn check_liveness(&mut self, now: Millis) -> Vec<RelayEvent> {
        if !matches!(self.state, RelayState::AwaitingWelcome | RelayState::Open) {
            return Vec::new();
        }
        let silent_for = now.saturating_sub(self.last_message_at);
        if silent_for > self.config.liveness_timeout_ms {
            warn!(silent_for_ms = silent_for, "relay silent, forcing close");
            self.socket.close();
            return self.on_close(now);
        }
        self.arm(now, RelayTimer::Watchdog);
        Vec::new()
    }

    fn send_ping(&mut self, now: Millis) {
        if self.state != RelayState::Open {
            return;
        }
        if !self.send(&ClientMessage::Ping {}) {
            debug!("keep-alive ping not sent");
        }
        self.arm(now, RelayTimer::Ping);
    }

    fn fail_permanently(&mut self) -> Vec<RelayEvent> {
        self.state = RelayState::Failed;
        self.client_id = None;
        self.timers.clear();
        self.socket.close();
        vec![RelayEvent::Failed]
    }

    fn arm(&mut self, now: Millis, timer: RelayTimer) {
        let period = match timer {
            RelayTimer::Watchdog => self.config.watchdog_interval_ms,
            RelayTimer::Ping => self.config.ping_interval_ms,
            RelayTimer::Reconnect => self.config.reconnect_interval_ms,
        };
        self.timers.cancel_where(|t| *t == timer);
        self.timers.schedule(now + period, timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::memory::MemoryRelaySocket;

    const URL: &str = "wss://relay.test/session";

    fn transport() -> (ReliableChannelTransport<MemoryRelaySocket>, MemoryRelaySocket) {
        let socket = MemoryRelaySocket::new();
        let fingerprint = Fingerprint::derive_with_salt(&["test-device"], &[7; 16]);
        let transport =
            ReliableChannelTransport::new(socket.clone(), fingerprint, RelayConfig::default());
        (transport, socket)
    }

    fn welcome(id: &str) -> String {
        format!(r#"{{"type":"welcome","payload":{{"client_id":"{}"}}}}"#, id)
    }

    fn open_session(transport: &mut ReliableChannelTransport<MemoryRelaySocket>, now: Millis) {
        transport.connect(URL, now);
        transport.on_open(now);
        let events = transport.on_frame(&welcome("5"), now);
        assert_eq!(
            events,
            vec![RelayEvent::Connected {
                client_id: PeerId::from("5")
            }]
        );
    }

    #[test]
    fn test_fingerprint_is_first_frame() {
        let (mut transport, socket) = transport();
        transport.connect(URL, 0);
        assert!(socket.sent().is_empty());

        transport.on_open(0);
        let sent = socket.sent();
        assert_eq!(sent.len(), 1);
        let first: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(first["type"], "fingerprint");
        assert_eq!(
            first["payload"]["fingerprint"],
            transport.fingerprint().as_str()
        );
    }

    #[test]
    fn test_send_refused_until_welcome() {
        let (mut transport, socket) = transport();
        transport.connect(URL, 0);
        assert!(!transport.send(&ClientMessage::Ping {}));
        transport.on_open(0);
        assert!(!transport.send(&ClientMessage::Ping {}));
        assert_eq!(socket.sent().len(), 1);

        transport.on_frame(&welcome("5"), 10);
        assert!(transport.is_open());
        assert!(transport.send(&ClientMessage::Ping {}));
        assert_eq!(transport.client_id(), Some(&PeerId::from("5")));
    }

    #[test]
    fn test_frames_before_welcome_dropped() {
        let (mut transport, _socket) = transport();
        transport.connect(URL, 0);
        transport.on_open(0);
        let events = transport.on_frame(
            r#"{"type":"peer_left","payload":{"peer_id":"8"}}"#,
            1,
        );
        assert!(events.is_empty());
        assert_eq!(transport.state(), RelayState::AwaitingWelcome);
    }

    #[test]
    fn test_rejection_is_permanent_and_generic() {
        let (mut transport, socket) = transport();
        transport.connect(URL, 0);
        transport.on_open(0);
        let events = transport.on_frame(
            r#"{"type":"rejected","payload":{"reason":"banned device"}}"#,
            5,
        );
        assert_eq!(events, vec![RelayEvent::Failed]);
        assert_eq!(transport.state(), RelayState::Failed);
        assert_eq!(transport.next_deadline(), None);

        // The socket's own close callback must not schedule a retry.
        assert!(transport.on_close(6).is_empty());
        assert!(transport.tick(100_000).is_empty());
        assert_eq!(socket.log().borrow().opened.len(), 1);
    }

    #[test]
    fn test_unexpected_close_schedules_reconnect() {
        let (mut transport, socket) = transport();
        open_session(&mut transport, 0);

        let events = transport.on_close(1_000);
        assert_eq!(
            events,
            vec![
                RelayEvent::Disconnected,
                RelayEvent::ReconnectScheduled { attempt: 1, max: 5 }
            ]
        );
        assert!(transport.tick(3_999).is_empty());
        assert_eq!(socket.log().borrow().opened.len(), 1);

        transport.tick(4_000);
        assert_eq!(transport.state(), RelayState::Connecting);
        assert_eq!(socket.log().borrow().opened.len(), 2);
    }

    #[test]
    fn test_reconnect_attempts_exhausted() {
        let (mut transport, _socket) = transport();
        transport.connect(URL, 0);
        let mut now = 0;
        for attempt in 1..=5 {
            let events = transport.on_close(now);
            assert_eq!(
                events,
                vec![RelayEvent::ReconnectScheduled { attempt, max: 5 }]
            );
            now += 3_000;
            transport.tick(now);
            assert_eq!(transport.state(), RelayState::Connecting);
        }
        assert_eq!(transport.on_close(now), vec![RelayEvent::Failed]);
        assert_eq!(transport.state(), RelayState::Failed);
    }

    #[test]
    fn test_welcome_resets_attempts() {
        let (mut transport, _socket) = transport();
        transport.connect(URL, 0);
        transport.on_close(0);
        transport.tick(3_000);
        transport.on_close(3_000);
        assert_eq!(transport.attempts(), 2);

        transport.tick(6_000);
        transport.on_open(6_000);
        transport.on_frame(&welcome("5"), 6_000);
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn test_manual_reconnect_resets_counter() {
        let (mut transport, socket) = transport();
        transport.connect(URL, 0);
        transport.on_close(0);
        transport.tick(3_000);
        transport.on_close(3_000);
        assert_eq!(transport.attempts(), 2);

        transport.reconnect_now(3_500);
        assert_eq!(transport.attempts(), 0);
        assert_eq!(transport.state(), RelayState::Connecting);
        assert_eq!(socket.log().borrow().opened.len(), 3);
    }

    #[test]
    fn test_watchdog_forces_close_after_silence() {
        let (mut transport, socket) = transport();
        open_session(&mut transport, 0);

        assert!(transport.tick(30_000).is_empty());
        assert!(transport.is_open());

        let events = transport.tick(31_000);
        assert_eq!(
            events,
            vec![
                RelayEvent::Disconnected,
                RelayEvent::ReconnectScheduled { attempt: 1, max: 5 }
            ]
        );
        assert!(socket.log().borrow().closes >= 1);
    }

    #[test]
    fn test_foreground_resets_silence() {
        let (mut transport, _socket) = transport();
        open_session(&mut transport, 0);

        // Backgrounded: timers throttled, nothing ran until the tab came back.
        transport.on_foreground(45_000);
        assert!(transport.tick(45_000).is_empty());
        assert!(transport.is_open());
    }

    #[test]
    fn test_any_frame_counts_as_liveness() {
        let (mut transport, _socket) = transport();
        open_session(&mut transport, 0);
        transport.on_frame(r#"{"type":"pong","payload":{}}"#, 20_000);
        transport.on_frame("garbage", 40_000);
        assert!(transport.tick(45_000).is_empty());
        assert!(transport.is_open());
    }

    #[test]
    fn test_intentional_disconnect_is_silent() {
        let (mut transport, _socket) = transport();
        open_session(&mut transport, 0);

        assert!(transport.disconnect(true, 100).is_empty());
        assert!(transport.on_close(101).is_empty());
        assert!(transport.tick(1_000_000).is_empty());
        assert_eq!(transport.state(), RelayState::Idle);
    }

    #[test]
    fn test_connect_after_intentional_disconnect_reenables_retry() {
        let (mut transport, _socket) = transport();
        open_session(&mut transport, 0);
        transport.disconnect(true, 100);

        transport.connect(URL, 200);
        transport.on_open(200);
        transport.on_frame(&welcome("5"), 200);
        let events = transport.on_close(300);
        assert!(events.contains(&RelayEvent::ReconnectScheduled { attempt: 1, max: 5 }));
    }

    #[test]
    fn test_malformed_frame_keeps_connection() {
        let (mut transport, _socket) = transport();
        open_session(&mut transport, 0);
        assert!(transport.on_frame("{\"type\":", 10).is_empty());
        assert!(transport.is_open());

        let events = transport.on_frame(r#"{"type":"peer_left","payload":{"peer_id":"8"}}"#, 20);
        assert_eq!(
            events,
            vec![RelayEvent::Message(RelayMessage::PeerLeft {
                peer_id: PeerId::from("8")
            })]
        );
    }

    #[test]
    fn test_fingerprint_reused_across_reconnects() {
        let (mut transport, socket) = transport();
        open_session(&mut transport, 0);
        transport.on_close(10);
        transport.tick(3_010);
        transport.on_open(3_010);

        let handshakes: Vec<_> = socket
            .sent()
            .into_iter()
            .filter(|f| f.contains("\"fingerprint\""))
            .collect();
        assert_eq!(handshakes.len(), 2);
        assert_eq!(handshakes[0], handshakes[1]);
    }

    #[test]
    fn test_refused_open_counts_as_attempt() {
        let (mut transport, socket) = transport();
        socket.set_refuse(true);
        let events = transport.connect(URL, 0);
        assert_eq!(
            events,
            vec![RelayEvent::ReconnectScheduled { attempt: 1, max: 5 }]
        );
    }

    #[test]
    fn test_keepalive_ping() {
        let (mut transport, socket) = transport();
        open_session(&mut transport, 0);
        transport.on_frame(r#"{"type":"pong","payload":{}}"#, 9_000);
        transport.tick(10_000);
        let pings = socket
            .sent()
            .iter()
            .filter(|f| f.contains("\"ping\""))
            .count();
        assert_eq!(pings, 1);
    }
}

//! Socket abstractions.
//!
//! The relay socket and peer data channels are non-blocking handles: calls
//! return immediately and completions come back through the owning
//! transport's `on_*` methods. Implementations may wrap a websocket, a
//! browser data channel, or (for tests) the in-memory types in [`memory`].

use crate::error::Result;

/// Handle to the relay connection.
pub trait RelaySocket {
    /// Begin opening a connection. Success is reported later through
    /// `ReliableChannelTransport::on_open`; an immediate error counts as a
    /// failed attempt.
    fn open(&mut self, url: &str) -> Result<()>;

    /// Write one text frame.
    fn send_text(&mut self, frame: &str) -> Result<()>;

    /// Close the connection. Must be safe to call when already closed.
    fn close(&mut self);
}

/// Handle to an open, ordered, reliable per-peer data channel.
pub trait DataChannel {
    /// Write one text frame.
    fn send_text(&mut self, frame: &str) -> Result<()>;

    /// Close the channel. Must be safe to call more than once.
    fn close(&mut self);
}

/// In-memory sockets that record traffic, for tests and simulations.
pub mod memory {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::error::TransportError;

    /// Everything a memory socket or channel saw.
    #[derive(Debug, Default)]
    pub struct SocketLog {
        pub opened: Vec<String>,
        pub sent: Vec<String>,
        pub closes: usize,
        /// When set, `open` and `send_text` fail.
        pub refuse: bool,
    }

    /// Relay socket backed by a shared [`SocketLog`].
    #[derive(Debug, Clone, Default)]
    pub struct MemoryRelaySocket {
        log: Rc<RefCell<SocketLog>>,
    }

    impl MemoryRelaySocket {
        pub fn new() -> Self {
            Self::default()
        }

        /// Shared view of the traffic log.
        pub fn log(&self) -> Rc<RefCell<SocketLog>> {
            Rc::clone(&self.log)
        }

        /// Frames sent so far.
        pub fn sent(&self) -> Vec<String> {
            self.log.borrow().sent.clone()
        }

        pub fn set_refuse(&self, refuse: bool) {
            self.log.borrow_mut().refuse = refuse;
        }
    }

    impl RelaySocket for MemoryRelaySocket {
        fn open(&mut self, url: &str) -> Result<()> {
            let mut log = self.log.borrow_mut();
            if log.refuse {
                return Err(TransportError::Socket("connection refused".into()));
            }
            log.opened.push(url.to_string());
            Ok(())
        }

        fn send_text(&mut self, frame: &str) -> Result<()> {
            let mut log = self.log.borrow_mut();
            if log.refuse {
                return Err(TransportError::Socket("socket not writable".into()));
            }
            log.sent.push(frame.to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.log.borrow_mut().closes += 1;
        }
    }

    /// Data channel backed by a shared [`SocketLog`].
    #[derive(Debug, Clone, Default)]
    pub struct MemoryDataChannel {
        log: Rc<RefCell<SocketLog>>,
    }

    impl MemoryDataChannel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn log(&self) -> Rc<RefCell<SocketLog>> {
            Rc::clone(&self.log)
        }

        pub fn sent(&self) -> Vec<String> {
            self.log.borrow().sent.clone()
        }

        pub fn closes(&self) -> usize {
            self.log.borrow().closes
        }
    }

    impl DataChannel for MemoryDataChannel {
        fn send_text(&mut self, frame: &str) -> Result<()> {
            let mut log = self.log.borrow_mut();
            if log.refuse || log.closes > 0 {
                return Err(TransportError::ChannelClosed);
            }
            log.sent.push(frame.to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.log.borrow_mut().closes += 1;
        }
    }
}

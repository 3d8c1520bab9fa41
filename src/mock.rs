//! Mock Transport
//!
//! In-memory [`DatagramTransport`] for exercising the protocol engine without
//! a network. Inbound datagrams are scripted with [`MockTransport::inject`] or
//! produced on demand by a responder closure; outbound datagrams are recorded.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = Arc::new(MockTransport::new());
//! mock.respond_with(|payload, _dest| {
//!     if payload == b"ID;" {
//!         vec![(b"MODEL=Acme-100;".to_vec(), "10.0.0.5:31115".parse().unwrap())]
//!     } else {
//!         vec![]
//!     }
//! });
//! let channel = SharedChannel::new(mock.clone());
//! ```

use crate::channel::{DatagramTransport, Reception, DEFAULT_GROUP, DEFAULT_PORT};
use crate::error::{AppResult, PactError};
use async_trait::async_trait;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

type Responder = Box<dyn Fn(&[u8], SocketAddr) -> Vec<(Vec<u8>, SocketAddr)> + Send + Sync>;

/// A datagram recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Payload as text (the protocol is ASCII).
    pub payload: String,
    /// Destination.
    pub dest: SocketAddr,
}

/// Scriptable in-memory transport.
pub struct MockTransport {
    group: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    sent: Mutex<Vec<SentDatagram>>,
    responder: Mutex<Option<Responder>>,
    send_failure: Mutex<Option<std::io::ErrorKind>>,
    closed: AtomicBool,
}

impl MockTransport {
    /// Create a mock bound to the default group address.
    pub fn new() -> Self {
        Self::with_group(SocketAddr::V4(SocketAddrV4::new(DEFAULT_GROUP, DEFAULT_PORT)))
    }

    /// Create a mock reporting `group` as its group address.
    pub fn with_group(group: SocketAddr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            group,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            send_failure: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a datagram as if it arrived from `source`.
    pub fn inject(&self, payload: impl AsRef<[u8]>, source: SocketAddr) {
        // The receiver lives as long as self, so this cannot fail.
        let _ = self.inbound_tx.send((payload.as_ref().to_vec(), source));
    }

    /// Install a closure that produces inbound datagrams for every send.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[u8], SocketAddr) -> Vec<(Vec<u8>, SocketAddr)> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Make every subsequent send fail with `kind` (`None` to clear).
    pub fn fail_sends(&self, kind: Option<std::io::ErrorKind>) {
        *lock(&self.send_failure) = kind;
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<SentDatagram> {
        lock(&self.sent).clone()
    }

    /// Payloads sent so far, in order.
    pub fn sent_payloads(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|d| d.payload.clone()).collect()
    }

    /// Forget recorded sends.
    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DatagramTransport for MockTransport {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> AppResult<()> {
        if self.is_closed() {
            return Err(PactError::ChannelClosed);
        }
        if let Some(kind) = *lock(&self.send_failure) {
            return Err(PactError::socket(
                format!("send to {dest}"),
                std::io::Error::from(kind),
            ));
        }

        lock(&self.sent).push(SentDatagram {
            payload: String::from_utf8_lossy(payload).into_owned(),
            dest,
        });

        let replies = lock(&self.responder)
            .as_ref()
            .map(|respond| respond(payload, dest))
            .unwrap_or_default();
        for (reply, source) in replies {
            self.inject(reply, source);
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> AppResult<Reception> {
        if self.is_closed() {
            return Err(PactError::ChannelClosed);
        }
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some((payload, source))) => Ok(Reception::Datagram { payload, source }),
            Ok(None) => Err(PactError::ChannelClosed),
            Err(_) => Ok(Reception::Timeout),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn group_addr(&self) -> SocketAddr {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sends_and_runs_responder() {
        let mock = MockTransport::new();
        let device: SocketAddr = "10.0.0.5:31115".parse().unwrap();
        mock.respond_with(move |payload, _| {
            if payload == b"ID;" {
                vec![(b"MODEL=Acme-100;".to_vec(), device)]
            } else {
                vec![]
            }
        });

        mock.send_to(b"ID;", mock.group_addr()).await.unwrap();
        mock.send_to(b"TEST;CMD=STOP;", device).await.unwrap();

        assert_eq!(mock.sent_payloads(), vec!["ID;", "TEST;CMD=STOP;"]);
        assert_eq!(
            mock.receive(Duration::from_millis(5)).await.unwrap(),
            Reception::Datagram {
                payload: b"MODEL=Acme-100;".to_vec(),
                source: device
            }
        );
        assert_eq!(
            mock.receive(Duration::from_millis(5)).await.unwrap(),
            Reception::Timeout
        );
    }

    #[tokio::test]
    async fn scripted_send_failure() {
        let mock = MockTransport::new();
        mock.fail_sends(Some(std::io::ErrorKind::ConnectionRefused));
        let err = mock.send_to(b"ID;", mock.group_addr()).await.unwrap_err();
        assert!(matches!(err, PactError::Socket { .. }));
        assert!(mock.sent().is_empty());

        mock.fail_sends(None);
        assert!(mock.send_to(b"ID;", mock.group_addr()).await.is_ok());
    }
}

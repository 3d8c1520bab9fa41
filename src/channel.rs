//! Multicast UDP channel.
//!
//! One [`MulticastChannel`] owns the single bound socket of a running
//! application. It is joined to the instrument multicast group and is used for
//! both phases of the protocol:
//!
//! - discovery: `ID;` goes to the group, replies come back unicast;
//! - control: start/stop go unicast to the selected device, telemetry comes
//!   back unicast.
//!
//! Components never hold the socket directly. They share a [`SharedChannel`],
//! which allows any number of concurrent senders but hands out at most one
//! [`ReceiverLease`] at a time. Two receive loops on one socket would race
//! for datagrams, so only the lease can call `receive`.
//!
//! The [`DatagramTransport`] trait is the seam between the protocol engine and
//! the socket; [`MockTransport`](crate::mock::MockTransport) implements it for
//! tests.

use crate::error::{AppResult, PactError};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// Largest datagram the protocol produces; longer datagrams are truncated.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Default instrument multicast group.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 3, 11, 15);

/// Default instrument UDP port.
pub const DEFAULT_PORT: u16 = 31115;

/// Socket options for [`MulticastChannel::open_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastConfig {
    /// Multicast group to join.
    pub group: Ipv4Addr,
    /// Local port to bind and destination port for group sends.
    pub port: u16,
    /// Interface used for the membership (UNSPECIFIED = OS default).
    pub interface: Ipv4Addr,
    /// TTL of outgoing multicast datagrams.
    pub ttl: u32,
    /// Whether our own group sends are looped back to us.
    pub loopback: bool,
}

impl MulticastConfig {
    /// Config for `group:port` with default socket options.
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            ..Default::default()
        }
    }

    /// Destination address for group sends.
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
        }
    }
}

/// Outcome of a bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reception {
    /// A datagram arrived.
    Datagram {
        /// Raw payload.
        payload: Vec<u8>,
        /// Sender address.
        source: SocketAddr,
    },
    /// Nothing arrived within the timeout. Not an error.
    Timeout,
}

/// Datagram transport used by the protocol engine.
///
/// # Contract
/// - `send_to` is fire-and-forget: success means the datagram left the
///   socket, not that anyone received it.
/// - `receive` blocks at most `timeout` and reports silence as
///   [`Reception::Timeout`].
/// - `close` is idempotent; afterwards every operation fails with
///   [`PactError::ChannelClosed`].
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram.
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> AppResult<()>;

    /// Wait up to `timeout` for one datagram.
    async fn receive(&self, timeout: Duration) -> AppResult<Reception>;

    /// Release the underlying resource.
    fn close(&self);

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;

    /// Destination address for group (discovery) sends.
    fn group_addr(&self) -> SocketAddr;
}

/// UDP socket bound to the instrument port and joined to the multicast group.
pub struct MulticastChannel {
    config: MulticastConfig,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl fmt::Debug for MulticastChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastChannel")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MulticastChannel {
    /// Open a channel on `group:port` with default socket options.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(group: Ipv4Addr, port: u16) -> AppResult<Self> {
        Self::open_with(&MulticastConfig::new(group, port))
    }

    /// Open a channel with explicit socket options.
    ///
    /// Creates the socket, enables address reuse, binds `(0.0.0.0, port)`,
    /// joins the group and hands the socket to Tokio. Every failure maps to
    /// [`PactError::Socket`].
    pub fn open_with(config: &MulticastConfig) -> AppResult<Self> {
        let socket = bind_multicast(config, Ipv4Addr::UNSPECIFIED)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| PactError::socket("query local address", e))?;

        info!(
            group = %config.group,
            port = config.port,
            local = %local_addr,
            "Multicast channel open"
        );

        Ok(Self {
            config: config.clone(),
            local_addr,
            socket: Mutex::new(Some(Arc::new(socket))),
        })
    }

    /// Socket options the channel was opened with.
    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    /// Locally bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn socket(&self) -> AppResult<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(PactError::ChannelClosed)
    }
}

/// Build a group member socket bound to `(bind_ip, config.port)`.
///
/// Binding to the group address instead of `0.0.0.0` makes the socket receive
/// group traffic only, so it never competes for unicast datagrams with another
/// socket sharing the port on the same host.
pub(crate) fn bind_multicast(config: &MulticastConfig, bind_ip: Ipv4Addr) -> AppResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| PactError::socket("create UDP socket", e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| PactError::socket("enable SO_REUSEADDR", e))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|e| PactError::socket("enable SO_REUSEPORT", e))?;

    let bind_addr = SocketAddrV4::new(bind_ip, config.port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| PactError::socket(format!("bind {bind_addr}"), e))?;

    socket
        .join_multicast_v4(&config.group, &config.interface)
        .map_err(|e| {
            PactError::socket(
                format!(
                    "join multicast group {} on {}",
                    config.group, config.interface
                ),
                e,
            )
        })?;
    if !config.interface.is_unspecified() {
        socket
            .set_multicast_if_v4(&config.interface)
            .map_err(|e| PactError::socket("set multicast interface", e))?;
    }
    socket
        .set_multicast_ttl_v4(config.ttl)
        .map_err(|e| PactError::socket("set multicast TTL", e))?;
    socket
        .set_multicast_loop_v4(config.loopback)
        .map_err(|e| PactError::socket("set multicast loopback", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| PactError::socket("set non-blocking", e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| PactError::socket("register socket with runtime", e))
}

#[async_trait]
impl DatagramTransport for MulticastChannel {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> AppResult<()> {
        let socket = self.socket()?;
        socket
            .send_to(payload, dest)
            .await
            .map_err(|e| PactError::socket(format!("send to {dest}"), e))?;
        debug!(%dest, bytes = payload.len(), "Datagram sent");
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> AppResult<Reception> {
        let socket = self.socket()?;
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Err(_) => Ok(Reception::Timeout),
            Ok(Ok((len, source))) => Ok(Reception::Datagram {
                payload: buf[..len].to_vec(),
                source,
            }),
            Ok(Err(e)) => Err(PactError::socket("receive datagram", e)),
        }
    }

    fn close(&self) {
        // A receive already in flight keeps its Arc until it returns.
        let released = self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if released.is_some() {
            info!(local = %self.local_addr, "Multicast channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    fn group_addr(&self) -> SocketAddr {
        self.config.group_addr()
    }
}

/// Shared handle to the application's one transport.
///
/// Cheap to clone. Sending needs no coordination; receiving requires a
/// [`ReceiverLease`].
#[derive(Clone)]
pub struct SharedChannel {
    transport: Arc<dyn DatagramTransport>,
    receive_lock: Arc<tokio::sync::Mutex<()>>,
    holder: Arc<Mutex<Option<&'static str>>>,
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel")
            .field("group", &self.transport.group_addr())
            .field("closed", &self.transport.is_closed())
            .field("receiver", &self.receiver_holder())
            .finish()
    }
}

impl SharedChannel {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn DatagramTransport>) -> Self {
        Self {
            transport,
            receive_lock: Arc::new(tokio::sync::Mutex::new(())),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Open a [`MulticastChannel`] and wrap it.
    pub fn open(config: &MulticastConfig) -> AppResult<Self> {
        Ok(Self::new(Arc::new(MulticastChannel::open_with(config)?)))
    }

    /// Send one datagram to `dest`.
    pub async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> AppResult<()> {
        self.transport.send_to(payload, dest).await
    }

    /// Send one datagram to the multicast group.
    pub async fn send_to_group(&self, payload: &[u8]) -> AppResult<()> {
        self.transport
            .send_to(payload, self.transport.group_addr())
            .await
    }

    /// Wait until the receive side is free and take it.
    pub async fn acquire_receiver(&self, holder: &'static str) -> AppResult<ReceiverLease> {
        self.ensure_open()?;
        let guard = self.receive_lock.clone().lock_owned().await;
        Ok(self.lease(guard, holder))
    }

    /// Take the receive side, or fail with [`PactError::ReceiverBusy`].
    pub fn try_acquire_receiver(&self, holder: &'static str) -> AppResult<ReceiverLease> {
        self.ensure_open()?;
        match self.receive_lock.clone().try_lock_owned() {
            Ok(guard) => Ok(self.lease(guard, holder)),
            Err(_) => Err(PactError::ReceiverBusy(format!(
                "receiver held by {}",
                self.receiver_holder().unwrap_or("another task")
            ))),
        }
    }

    /// Name of the current receive lease holder, if any.
    pub fn receiver_holder(&self) -> Option<&'static str> {
        *self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the underlying transport. Idempotent.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Destination address for group sends.
    pub fn group_addr(&self) -> SocketAddr {
        self.transport.group_addr()
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.transport.is_closed() {
            Err(PactError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn lease(&self, guard: OwnedMutexGuard<()>, holder: &'static str) -> ReceiverLease {
        *self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(holder);
        debug!(holder, "Receiver lease acquired");
        ReceiverLease {
            transport: self.transport.clone(),
            holder: self.holder.clone(),
            name: holder,
            _guard: guard,
        }
    }
}

/// Exclusive right to receive from a [`SharedChannel`]. Released on drop.
pub struct ReceiverLease {
    transport: Arc<dyn DatagramTransport>,
    holder: Arc<Mutex<Option<&'static str>>>,
    name: &'static str,
    _guard: OwnedMutexGuard<()>,
}

impl fmt::Debug for ReceiverLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverLease")
            .field("holder", &self.name)
            .finish()
    }
}

impl ReceiverLease {
    /// Wait up to `timeout` for one datagram.
    pub async fn receive(&self, timeout: Duration) -> AppResult<Reception> {
        self.transport.receive(timeout).await
    }
}

impl Drop for ReceiverLease {
    fn drop(&mut self) {
        let mut holder = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *holder == Some(self.name) {
            *holder = None;
        }
        debug!(holder = self.name, "Receiver lease released");
    }
}

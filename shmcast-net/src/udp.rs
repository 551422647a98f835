//! UDP multicast bus session.
//!
//! Each session id maps to the multicast group `225.0.0.<cid>` on a fixed
//! port. Every envelope is sent as a single datagram; anything that does not
//! fit is rejected rather than fragmented.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use shmcast_protocol::media::{encode_envelope, Envelope};

use crate::bus::{Bus, BusHandle};

/// UDP port shared by all sessions.
pub const SESSION_PORT: u16 = 12175;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Multicast group for a session id.
pub fn session_group(cid: u8) -> Ipv4Addr {
    Ipv4Addr::new(225, 0, 0, cid)
}

/// A send-side UDP multicast session.
pub struct UdpBus {
    socket: UdpSocket,
    target: SocketAddrV4,
    handle: BusHandle,
    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl UdpBus {
    /// Open a session on the multicast group for `cid`.
    pub fn connect(cid: u8) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("failed to bind UDP socket")?;
        socket
            .set_multicast_loop_v4(true)
            .context("failed to enable multicast loopback")?;
        socket
            .set_multicast_ttl_v4(1)
            .context("failed to set multicast TTL")?;

        let target = SocketAddrV4::new(session_group(cid), SESSION_PORT);
        tracing::info!(cid, %target, "bus session connected");

        Ok(Self {
            socket,
            target,
            handle: BusHandle::new(),
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    /// Handle for ending the session from elsewhere (e.g. a signal handler).
    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Bus for UdpBus {
    fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let data = encode_envelope(&envelope).context("failed to serialize envelope")?;
        anyhow::ensure!(
            data.len() <= MAX_DATAGRAM_BYTES,
            "envelope of {} bytes exceeds datagram limit of {} bytes",
            data.len(),
            MAX_DATAGRAM_BYTES
        );

        self.socket
            .send_to(&data, self.target)
            .context("failed to send datagram")?;

        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);

        tracing::trace!(
            data_type = envelope.data_type,
            sender_stamp = envelope.sender_stamp,
            wire_bytes = data.len(),
            "sent envelope"
        );
        Ok(())
    }
}

impl Drop for UdpBus {
    fn drop(&mut self) {
        self.handle.stop();
        tracing::debug!(
            datagrams = self.datagrams_sent(),
            bytes = self.bytes_sent(),
            "bus session closed"
        );
    }
}

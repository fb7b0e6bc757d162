//! Blocking byte-stream channel to a remote renderer.
//!
//! ```text
//! send(bytes)            ─ one send(2), short write = disconnect
//! receive(buf)           ─ fills buf, EOF/error = disconnect
//! send_descriptors(fds)  ─ sendmsg(2) with SCM_RIGHTS + 16-byte sentinel
//! ```
//!
//! Every failure flips the channel to disconnected for good and notifies the
//! observer exactly once. There is no reconnect; build a new channel.

use std::io::{self, IoSlice, Read};
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hwclink_core::TransportError;
use rustix::net::{sendmsg, SendAncillaryBuffer, SendAncillaryMessage, SendFlags};
use tracing::{debug, trace, warn};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Marker in the first word of the descriptor-transfer payload.
pub const FD_SENTINEL: i32 = 0x88;

/// Length of the payload that carries the descriptors.
pub const FD_PAYLOAD_LEN: usize = 16;

/// Upper bound on descriptors per transfer (kernel SCM_MAX_FD is 253).
pub const MAX_FDS_PER_TRANSFER: usize = 253;

/// Identifies a channel to its observer; the socket descriptor number.
pub type ChannelId = RawFd;

// ── Observer ──────────────────────────────────────────────────────────────────

/// Connection status notifications.
pub trait ChannelObserver: Send + Sync {
    /// The remote side described its display; the session is usable.
    fn on_connect(&self, id: ChannelId);

    /// The channel failed and will never carry data again.
    fn on_disconnect(&self, id: ChannelId);
}

// ── Channel ───────────────────────────────────────────────────────────────────

pub struct Channel {
    stream: UnixStream,
    id: ChannelId,
    disconnected: AtomicBool,
    connect_notified: AtomicBool,
    observer: Option<Arc<dyn ChannelObserver>>,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        let id = stream.as_raw_fd();
        Self {
            stream,
            id,
            disconnected: AtomicBool::new(false),
            connect_notified: AtomicBool::new(false),
            observer: None,
        }
    }

    pub fn with_observer(stream: UnixStream, observer: Arc<dyn ChannelObserver>) -> Self {
        let mut channel = Self::new(stream);
        channel.observer = Some(observer);
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    /// Writes `buf` with a single send. An empty payload succeeds without I/O.
    pub fn send(&self, buf: &[u8]) -> Result<(), TransportError> {
        trace!("Channel({})::send size={}", self.id, buf.len());
        self.ensure_connected()?;
        if buf.is_empty() {
            return Ok(());
        }

        match rustix::net::send(&self.stream, buf, SendFlags::NOSIGNAL) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(0) => {
                self.mark_disconnected();
                Err(TransportError::SendFailed { reason: "peer accepted 0 bytes".into() })
            }
            Ok(n) => {
                self.mark_disconnected();
                Err(TransportError::ShortWrite { written: n, expected: buf.len() })
            }
            Err(e) => {
                self.mark_disconnected();
                Err(TransportError::SendFailed { reason: e.to_string() })
            }
        }
    }

    /// Fills `buf` completely. An empty buffer succeeds without I/O.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        trace!("Channel({})::receive size={}", self.id, buf.len());
        self.ensure_connected()?;

        let mut filled = 0;
        while filled < buf.len() {
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => {
                    self.mark_disconnected();
                    return Err(TransportError::ReceiveFailed {
                        reason: format!("peer closed after {filled} of {} bytes", buf.len()),
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_disconnected();
                    return Err(TransportError::ReceiveFailed { reason: e.to_string() });
                }
            }
        }
        Ok(())
    }

    /// Passes `fds` to the peer as SCM_RIGHTS alongside the sentinel payload.
    ///
    /// The caller keeps ownership of its descriptors; the peer receives
    /// duplicates it must close itself.
    pub fn send_descriptors(&self, fds: &[BorrowedFd<'_>]) -> Result<(), TransportError> {
        trace!("Channel({})::send_descriptors count={}", self.id, fds.len());
        self.ensure_connected()?;
        if fds.is_empty() {
            return Ok(());
        }
        if fds.len() > MAX_FDS_PER_TRANSFER {
            return Err(TransportError::DescriptorTransfer {
                reason: format!("{} descriptors exceed limit {}", fds.len(), MAX_FDS_PER_TRANSFER),
            });
        }

        let mut payload = [0u8; FD_PAYLOAD_LEN];
        payload[..4].copy_from_slice(&FD_SENTINEL.to_ne_bytes());
        let iov = [IoSlice::new(&payload)];

        let mut cmsg_space = vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))];
        let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);
        if !cmsg_buffer.push(SendAncillaryMessage::ScmRights(fds)) {
            return Err(TransportError::DescriptorTransfer {
                reason: "control buffer too small".into(),
            });
        }

        match sendmsg(self.stream.as_fd(), &iov, &mut cmsg_buffer, SendFlags::NOSIGNAL) {
            Ok(n) if n > 0 => Ok(()),
            Ok(_) => {
                self.mark_disconnected();
                Err(TransportError::DescriptorTransfer { reason: "sendmsg wrote 0 bytes".into() })
            }
            Err(e) => {
                self.mark_disconnected();
                Err(TransportError::DescriptorTransfer { reason: e.to_string() })
            }
        }
    }

    /// Reports the connection as usable. Fires `on_connect` at most once.
    pub fn notify_connected(&self) {
        if self.connect_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(observer) = &self.observer {
            observer.on_connect(self.id);
        }
    }

    /// Shuts the socket down so a thread blocked in `receive` returns.
    pub fn shutdown(&self) {
        debug!("Channel({}) shutdown requested", self.id);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!("Channel({}) shutdown failed: {e}", self.id);
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    fn mark_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Channel({}) disconnected", self.id);
        if let Some(observer) = &self.observer {
            observer.on_disconnect(self.id);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug!("Close socket {}", self.id);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

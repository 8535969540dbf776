//! Generic netlink socket (Linux)
//!
//! A raw `NETLINK_GENERIC` socket bound to an autoselected port id. Family
//! ids are resolved through the generic netlink controller. Kernel auto-acks
//! are never requested.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use super::{ChannelEvent, KernelChannel};
use crate::wire::{self, Attribute, GenlMessage, NetlinkMessage};
use crate::{RelayError, Result};

/// Fixed id of the generic netlink controller family
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

/// Controller protocol version
const CTRL_VERSION: u8 = 1;

/// Large enough for any hwsim frame message
const RECV_BUFFER_SIZE: usize = 32 * 1024;

/// Reads spent waiting for the controller's answer before giving up
const RESOLVE_MAX_READS: usize = 16;

/// Generic netlink socket implementing [`KernelChannel`]
#[derive(Debug, Default)]
pub struct GenlSocket {
    fd: OnceLock<OwnedFd>,
    seq: AtomicU32,
    /// Messages decoded from a datagram but not yet handed out
    pending: Mutex<VecDeque<NetlinkMessage>>,
}

impl GenlSocket {
    /// Create an unconnected socket
    pub fn new() -> Self {
        Self::default()
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.fd
            .get()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| RelayError::ChannelUnavailable("netlink socket not connected".to_string()))
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn open_socket() -> Result<OwnedFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = Self::kernel_addr();
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(fd)
    }

    /// Netlink address with port id 0: the kernel when sending, an
    /// autoselected port when binding
    fn kernel_addr() -> libc::sockaddr_nl {
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr
    }

    fn send_raw(&self, data: &[u8]) -> Result<()> {
        let fd = self.raw_fd()?;
        let addr = Self::kernel_addr();
        let sent = unsafe {
            libc::sendto(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(RelayError::SendFailed(io::Error::last_os_error().to_string()));
        }
        if sent as usize != data.len() {
            return Err(RelayError::SendFailed(format!(
                "short netlink send: {} of {} bytes",
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    /// Read one datagram; `None` when the receive timeout elapsed
    fn recv_raw(&self) -> Result<Option<Vec<NetlinkMessage>>> {
        let fd = self.raw_fd()?;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let received = unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if received < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err.into()),
            };
        }
        buf.truncate(received as usize);
        Ok(Some(wire::decode_all(&buf)?))
    }
}

impl KernelChannel for GenlSocket {
    fn connect(&self) -> Result<()> {
        if self.fd.get().is_some() {
            return Ok(());
        }
        let fd = Self::open_socket()?;
        // a concurrent connect may have won; its socket is kept
        let _ = self.fd.set(fd);
        log::debug!("Generic netlink socket opened");
        Ok(())
    }

    fn resolve_family(&self, name: &str) -> Result<Option<u16>> {
        let seq = self.next_seq();
        let mut request = GenlMessage::new(GENL_ID_CTRL, CTRL_CMD_GETFAMILY, CTRL_VERSION)
            .with_attr(Attribute::string(CTRL_ATTR_FAMILY_NAME, name));
        request.seq = seq;
        self.send_raw(&request.encode())?;

        for _ in 0..RESOLVE_MAX_READS {
            let Some(messages) = self.recv_raw()? else {
                return Ok(None);
            };
            for message in messages {
                match message {
                    NetlinkMessage::Error { code, header } if header.seq == seq => {
                        if code == -libc::ENOENT || code == 0 {
                            return Ok(None);
                        }
                        return Err(io::Error::from_raw_os_error(-code).into());
                    }
                    NetlinkMessage::Genl(reply) if reply.seq == seq && reply.family == GENL_ID_CTRL => {
                        return Ok(reply.attrs.get_u16(CTRL_ATTR_FAMILY_ID));
                    }
                    other => self
                        .pending
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push_back(other),
                }
            }
        }

        Ok(None)
    }

    fn set_receive_timeout(&self, timeout: Duration) -> Result<()> {
        let fd = self.raw_fd()?;
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn send(&self, message: &GenlMessage) -> Result<()> {
        let mut message = message.clone();
        if message.seq == 0 {
            message.seq = self.next_seq();
        }
        self.send_raw(&message.encode())
    }

    fn receive(&self) -> Result<ChannelEvent> {
        let queued = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(message) = queued {
            return Ok(ChannelEvent::Message(message));
        }

        let Some(messages) = self.recv_raw()? else {
            return Ok(ChannelEvent::Timeout);
        };

        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.extend(messages);
        Ok(match pending.pop_front() {
            Some(message) => ChannelEvent::Message(message),
            None => ChannelEvent::Timeout,
        })
    }
}

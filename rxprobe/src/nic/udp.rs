//! UDP datagram backend.
//!
//! Receives the benchmark stream as UDP datagrams instead of raw frames, so
//! a run needs no raw-socket privileges. Each datagram is written directly
//! into the posted buffer right after an (all-zero) link-header region, which
//! keeps the payload at the same buffer offset as on the raw-frame backend.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};

use mio::net::UdpSocket as MioUdpSocket;
use rustix::io::Errno;
use rustix::net::{RecvFlags, recv, sockopt};

use crate::config::LINK_HEADER_LEN;
use crate::nic::ring::RxRing;
use crate::nic::{DeviceAddr, Event, MemRegistration, Nic, NicError, QueueConfig, QueueMode};
use crate::pool::SlotId;
use crate::pool::region::DmaRegion;
use crate::trace::{debug, info, warn};

/// Socket receive buffer requested at open; the kernel may clamp it.
pub const DEFAULT_SOCKET_BUFFER: usize = 8 * 1024 * 1024;

/// Receive queue fed by a non-blocking UDP socket.
pub struct UdpNic {
    socket: MioUdpSocket,
    ring: RxRing,
}

impl UdpNic {
    /// Binds the socket and allocates the receive ring.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub fn open(bind: SocketAddr, queue: QueueConfig) -> Result<Self, NicError> {
        let socket = MioUdpSocket::bind(bind).map_err(|e| NicError::new("bind", e))?;
        let nic = Self {
            socket,
            ring: RxRing::new(&queue),
        };

        if let Err(_e) = nic.set_recv_buffer_size(DEFAULT_SOCKET_BUFFER) {
            warn!(error = %_e, "could not enlarge socket receive buffer");
        }
        if queue.mode == QueueMode::Physical {
            debug!("UDP backend: physical mode only locks the buffer pool");
        }
        info!(
            local_addr = ?nic.local_addr().ok(),
            ring = queue.rx_ring_size,
            rx_buffer_len = queue.rx_buffer_len,
            "UDP receive queue open"
        );
        Ok(nic)
    }

    /// Address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Asks the kernel for `bytes` of datagram backlog (`SO_RCVBUF`).
    ///
    /// # Errors
    ///
    /// Fails if the socket rejects the option.
    pub fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()> {
        sockopt::set_socket_recv_buffer_size(&self.socket, bytes)?;
        Ok(())
    }

    /// Backlog the kernel actually granted; Linux reports twice the request.
    ///
    /// # Errors
    ///
    /// Fails if the option cannot be read.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(sockopt::get_socket_recv_buffer_size(&self.socket)?)
    }
}

impl AsFd for UdpNic {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl Nic for UdpNic {
    fn register_memory(&mut self, region: &DmaRegion) -> Result<MemRegistration, NicError> {
        self.ring.register(region)
    }

    fn post_receive(&mut self, addr: DeviceAddr, slot: SlotId) -> Result<(), NicError> {
        self.ring.post(addr, slot)
    }

    fn commit_posted(&mut self) {
        self.ring.push();
    }

    fn poll_events(&mut self, events: &mut [Event]) -> Result<usize, NicError> {
        let mut n = 0;
        while n < events.len() {
            let Some((desc, buf)) = self.ring.front_buffer() else {
                break;
            };
            let (header, body) = buf.split_at_mut(LINK_HEADER_LEN);
            let body_len = body.len();
            // TRUNC reports the datagram's real length even when it did not fit.
            match recv(&self.socket, body, RecvFlags::TRUNC) {
                Ok(len) => {
                    header.fill(0);
                    let fits = len <= body_len;
                    self.ring.pop();
                    events[n] = Event::Rx {
                        slot: desc.slot,
                        len: LINK_HEADER_LEN + len.min(body_len),
                        start_of_packet: true,
                        continuation: !fits,
                    };
                    n += 1;
                }
                Err(e) if e == Errno::AGAIN => break,
                Err(e) if e == Errno::INTR => {}
                Err(e) => return Err(NicError::new("poll_events", io::Error::from(e))),
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn queue() -> QueueConfig {
        QueueConfig {
            rx_ring_size: 4,
            rx_buffer_len: 64,
            mode: QueueMode::Virtual,
        }
    }

    fn open_loopback() -> (UdpNic, DmaRegion) {
        let mut nic = UdpNic::open("127.0.0.1:0".parse().unwrap(), queue()).unwrap();
        let region = DmaRegion::map(4 * 64, false).unwrap();
        nic.register_memory(&region).unwrap();
        for i in 0..4u32 {
            let addr = DeviceAddr(region.host_addr() + u64::from(i) * 64);
            nic.post_receive(addr, SlotId::new(i)).unwrap();
        }
        nic.commit_posted();
        (nic, region)
    }

    #[test]
    fn bind_assigns_port() {
        let (nic, _region) = open_loopback();
        let addr = nic.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn empty_socket_polls_nothing() {
        let (mut nic, _region) = open_loopback();
        let mut events = [Event::EMPTY; 4];
        assert_eq!(nic.poll_events(&mut events).unwrap(), 0);
    }

    #[test]
    fn datagram_lands_after_link_header() {
        let (mut nic, region) = open_loopback();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&42u32.to_le_bytes(), nic.local_addr().unwrap())
            .unwrap();

        let mut events = [Event::EMPTY; 4];
        let mut n = 0;
        for _ in 0..1000 {
            n = nic.poll_events(&mut events).unwrap();
            if n > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(n, 1);
        assert!(matches!(
            events[0],
            Event::Rx { len, start_of_packet: true, continuation: false, .. } if len == LINK_HEADER_LEN + 4
        ));
        // SAFETY: slot 0 completed; nothing else views it.
        let bytes = unsafe { region.bytes(0, LINK_HEADER_LEN + 4) };
        assert_eq!(&bytes[LINK_HEADER_LEN..], &42u32.to_le_bytes());
    }

    #[test]
    fn oversized_datagram_is_flagged() {
        let (mut nic, _region) = open_loopback();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[7u8; 200], nic.local_addr().unwrap()).unwrap();

        let mut events = [Event::EMPTY; 4];
        let mut n = 0;
        for _ in 0..1000 {
            n = nic.poll_events(&mut events).unwrap();
            if n > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(n, 1);
        assert!(matches!(events[0], Event::Rx { len: 64, continuation: true, .. }));
    }

    #[test]
    fn recv_buffer_size_is_adjustable() {
        let (nic, _region) = open_loopback();
        let before = nic.recv_buffer_size().unwrap();
        assert!(before > 0);
        nic.set_recv_buffer_size(before * 2).unwrap();
        assert!(nic.recv_buffer_size().unwrap() >= before);
    }
}

//! Raw Ethernet backend on a Linux `AF_PACKET` socket.
//!
//! Frames arrive whole, link header included, exactly as the device would
//! DMA them. The socket is non-blocking and bound to a single interface.
//! Requires `CAP_NET_RAW`.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use rustix::io::Errno;
use rustix::net::{RecvFlags, recv};

use crate::nic::ring::RxRing;
use crate::nic::{
    DeviceAddr, Event, MacAddr, MemRegistration, Nic, NicError, QueueConfig, QueueMode,
};
use crate::pool::SlotId;
use crate::pool::region::DmaRegion;
use crate::trace::{debug, info};

/// Resolves an interface given by name (`eth0`) or by numeric index (`2`).
///
/// Returns `None` if no such interface exists.
#[must_use]
pub fn resolve_interface(name: &str) -> Option<u32> {
    if let Ok(index) = name.parse::<u32>() {
        return (index != 0).then_some(index);
    }
    let name = CString::new(name).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string for the whole call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    (index != 0).then_some(index)
}

/// An `ifreq` naming interface `ifindex`, ready for an interface ioctl.
fn interface_request(ifindex: u32) -> Result<libc::ifreq, NicError> {
    let mut name = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: `name` has the IF_NAMESIZE bytes if_indextoname writes.
    if unsafe { libc::if_indextoname(ifindex, name.as_mut_ptr()) }.is_null() {
        return Err(NicError::last_os_error("if_indextoname"));
    }
    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    req.ifr_name = name;
    Ok(req)
}

/// Receive queue bound to one network interface.
pub struct PacketNic {
    fd: OwnedFd,
    ifindex: u32,
    ring: RxRing,
    filter: Option<MacAddr>,
    filtered: u64,
}

impl PacketNic {
    /// Opens a raw socket on interface `ifindex`.
    ///
    /// # Errors
    ///
    /// Fails without `CAP_NET_RAW` or if the interface does not exist.
    pub fn open(ifindex: u32, queue: QueueConfig) -> Result<Self, NicError> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        // SAFETY: plain syscall; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from(protocol),
            )
        };
        if raw < 0 {
            return Err(NicError::last_os_error("socket"));
        }
        // SAFETY: `raw` is a freshly created descriptor nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let sll_ifindex =
            i32::try_from(ifindex).map_err(|_| NicError::from_errno("bind", libc::ENODEV))?;
        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = sll_ifindex;
        // SAFETY: `addr` is a fully initialized sockaddr_ll of the length passed.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(NicError::last_os_error("bind"));
        }

        if queue.mode == QueueMode::Physical {
            debug!("packet backend: physical mode only locks the buffer pool");
        }
        info!(
            ifindex,
            ring = queue.rx_ring_size,
            rx_buffer_len = queue.rx_buffer_len,
            "raw receive queue open"
        );
        Ok(Self {
            fd,
            ifindex,
            ring: RxRing::new(&queue),
            filter: None,
            filtered: 0,
        })
    }

    #[must_use]
    pub const fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Hardware address of the bound interface.
    ///
    /// # Errors
    ///
    /// Fails if the interface vanished or the address cannot be read.
    pub fn local_mac(&self) -> Result<MacAddr, NicError> {
        let mut req = interface_request(self.ifindex)?;
        // SAFETY: SIOCGIFHWADDR reads ifr_name and writes ifru_hwaddr of `req`.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::SIOCGIFHWADDR, &raw mut req) };
        if rc < 0 {
            return Err(NicError::last_os_error("SIOCGIFHWADDR"));
        }

        // SAFETY: a successful SIOCGIFHWADDR initialized the hwaddr member.
        let data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
        let mut mac = [0u8; 6];
        for (dst, src) in mac.iter_mut().zip(data) {
            *dst = src as u8;
        }
        Ok(MacAddr(mac))
    }

    /// Interface name, for log lines.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        let mut name = [0 as libc::c_char; libc::IF_NAMESIZE];
        // SAFETY: `name` has the IF_NAMESIZE bytes if_indextoname writes.
        let ptr = unsafe { libc::if_indextoname(self.ifindex, name.as_mut_ptr()) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: on success the buffer holds a NUL-terminated name.
        let name = unsafe { CStr::from_ptr(ptr) };
        Some(name.to_string_lossy().into_owned())
    }

    /// Only deliver frames addressed to `mac`; the rest are skipped without
    /// consuming a descriptor.
    pub fn install_receive_filter(&mut self, mac: MacAddr) {
        info!(%mac, "receive filter installed");
        self.filter = Some(mac);
    }

    /// Frames skipped by the receive filter so far.
    #[must_use]
    pub const fn filtered(&self) -> u64 {
        self.filtered
    }
}

impl AsFd for PacketNic {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Nic for PacketNic {
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
        // Filtered frames count against the budget so one poll stays bounded.
        for _ in 0..events.len() {
            let Some((desc, buf)) = self.ring.front_buffer() else {
                break;
            };
            let capacity = buf.len();
            let len = match recv(&self.fd, buf, RecvFlags::TRUNC) {
                Ok(len) => len,
                Err(e) if e == Errno::AGAIN => break,
                Err(e) if e == Errno::INTR => continue,
                Err(e) => return Err(NicError::new("poll_events", io::Error::from(e))),
            };
            if let Some(mac) = self.filter {
                if len < 6 || buf[..6] != mac.0 {
                    self.filtered += 1;
                    continue;
                }
            }
            self.ring.pop();
            events[n] = Event::Rx {
                slot: desc.slot,
                len: len.min(capacity),
                start_of_packet: true,
                continuation: len > capacity,
            };
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_interface_resolves_to_itself() {
        assert_eq!(resolve_interface("3"), Some(3));
        assert_eq!(resolve_interface("0"), None);
    }

    #[test]
    fn loopback_resolves_by_name() {
        assert!(resolve_interface("lo").is_some());
        assert_eq!(resolve_interface("no-such-if0"), None);
        assert_eq!(resolve_interface("bad\0name"), None);
    }

    #[test]
    fn interface_request_names_the_interface() {
        let index = resolve_interface("lo").unwrap();
        let req = interface_request(index).unwrap();
        // SAFETY: if_indextoname wrote a NUL-terminated name.
        let name = unsafe { CStr::from_ptr(req.ifr_name.as_ptr()) };
        assert_eq!(name.to_str().unwrap(), "lo");
        assert!(interface_request(u32::MAX).is_err());
    }

    #[test]
    #[ignore = "needs CAP_NET_RAW"]
    fn loopback_socket_reports_zero_mac() {
        let index = resolve_interface("lo").unwrap();
        let queue = QueueConfig {
            rx_ring_size: 4,
            rx_buffer_len: 2048,
            mode: QueueMode::Virtual,
        };
        let nic = PacketNic::open(index, queue).unwrap();
        assert_eq!(nic.local_mac().unwrap(), MacAddr([0; 6]));
        assert_eq!(nic.name().as_deref(), Some("lo"));
    }
}

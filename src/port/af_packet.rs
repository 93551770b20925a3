// ==========================================
// Raw Ethernet port on a Linux interface
// ==========================================

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::packet::{Packet, PacketPool};
use crate::port::{Port, SendOutcome};

/// Largest frame accepted at capture. GRO hands up coalesced frames as
/// large as the IP length field allows.
const MAX_FRAME_LEN: usize = 65535;

// Not exported by every libc version.
const PACKET_IGNORE_OUTGOING: libc::c_int = 23;

const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PortError {
    #[error("invalid interface name {0:?}")]
    InvalidName(String),
    #[error("no such interface {name}: {source}")]
    NoSuchInterface { name: String, source: io::Error },
    #[error("cannot open raw socket on {name}: {source}")]
    Socket { name: String, source: io::Error },
    #[error("cannot bind to {name}: {source}")]
    Bind { name: String, source: io::Error },
    #[error("cannot enable promiscuous mode on {name}: {source}")]
    Promiscuous { name: String, source: io::Error },
}

pub struct AfPacketPort {
    name: String,
    fd: OwnedFd,
    pool: Arc<PacketPool>,
    rx_buf: Mutex<BytesMut>,
    no_buffer: AtomicU64,
    truncated: AtomicU64,
}

impl AfPacketPort {
    pub fn open(name: &str, pool: Arc<PacketPool>) -> Result<Self, PortError> {
        let c_name = CString::new(name).map_err(|_| PortError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(PortError::NoSuchInterface {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(PortError::Socket {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: all-zeroes is a valid sockaddr_ll.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as i32;
        // SAFETY: addr is a properly initialised sockaddr_ll of the given size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(PortError::Bind {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: all-zeroes is a valid packet_mreq.
        let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
        mreq.mr_ifindex = ifindex as i32;
        mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
        let promisc = setsockopt(&fd, libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq);
        if let Err(source) = promisc {
            return Err(PortError::Promiscuous {
                name: name.to_string(),
                source,
            });
        }

        // Without this the socket would capture its own transmissions.
        let one: libc::c_int = 1;
        if let Err(e) = setsockopt(&fd, libc::SOL_PACKET, PACKET_IGNORE_OUTGOING, &one) {
            warn!(
                port = name,
                error = %e,
                "PACKET_IGNORE_OUTGOING unsupported, own frames will be re-captured"
            );
        }

        info!(port = name, ifindex, "port opened");
        Ok(Self {
            name: name.to_string(),
            fd,
            pool,
            rx_buf: Mutex::new(BytesMut::with_capacity(MAX_FRAME_LEN)),
            no_buffer: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
        })
    }
}

fn setsockopt<T>(fd: &OwnedFd, level: libc::c_int, opt: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: value points to a live T of the given size.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            opt,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[derive(Debug)]
enum Recv {
    Frame(Bytes),
    /// Longer than the buffer; carries the real length. The frame is gone.
    Oversized(usize),
    Empty,
}

/// Receive one frame into the spare capacity of `buf`. Frames are split off
/// `buf`, so consecutive small frames share one allocation.
fn recv_frame(fd: &OwnedFd, buf: &mut BytesMut, max_len: usize) -> io::Result<Recv> {
    buf.clear();
    buf.reserve(max_len);
    // SAFETY: buf is empty with at least max_len bytes of capacity.
    // MSG_TRUNC makes the kernel return the full frame length even when it
    // copied only max_len bytes.
    let n = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            max_len,
            libc::MSG_DONTWAIT | libc::MSG_TRUNC,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Recv::Empty),
            _ => Err(err),
        };
    }
    let n = n as usize;
    if n > max_len {
        return Ok(Recv::Oversized(n));
    }
    // SAFETY: the kernel wrote n <= max_len bytes.
    unsafe { buf.set_len(n) };
    Ok(Recv::Frame(buf.split().freeze()))
}

#[derive(Debug)]
enum Sent {
    Sent,
    /// Device queue full; try again later.
    Busy,
    /// The device will never take this frame.
    Refused(io::Error),
}

fn send_frame(fd: &OwnedFd, data: &[u8]) -> Sent {
    // SAFETY: data is a live slice for the duration of the call.
    let n = unsafe {
        libc::send(
            fd.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    if n >= 0 {
        return Sent::Sent;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::ENOBUFS) | Some(libc::EINTR) => Sent::Busy,
        _ => Sent::Refused(err),
    }
}

impl Port for AfPacketPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_burst(&self, out: &mut Vec<Packet>, max: usize) -> usize {
        let mut buf = self.rx_buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut received = 0;
        while received < max {
            match recv_frame(&self.fd, &mut buf, MAX_FRAME_LEN) {
                Ok(Recv::Frame(data)) => match Packet::new(&self.pool, data) {
                    Ok(pkt) => {
                        out.push(pkt);
                        received += 1;
                    }
                    Err(_) => {
                        self.no_buffer.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Ok(Recv::Oversized(len)) => {
                    self.truncated.fetch_add(1, Ordering::Relaxed);
                    debug!(port = %self.name, len, "oversized frame dropped");
                }
                Ok(Recv::Empty) => break,
                Err(err) => {
                    debug!(port = %self.name, error = %err, "recv failed");
                    break;
                }
            }
        }
        received
    }

    fn send_burst(&self, packets: &[Packet]) -> SendOutcome {
        for (i, pkt) in packets.iter().enumerate() {
            match send_frame(&self.fd, pkt.payload()) {
                Sent::Sent => {}
                Sent::Busy => return SendOutcome::sent(i),
                Sent::Refused(err) => {
                    debug!(port = %self.name, error = %err, len = pkt.len(), "frame refused");
                    return SendOutcome::rejected_after(i);
                }
            }
        }
        SendOutcome::sent(packets.len())
    }

    fn rx_no_buffer(&self) -> u64 {
        self.no_buffer.load(Ordering::Relaxed)
    }

    fn rx_truncated(&self) -> u64 {
        self.truncated.load(Ordering::Relaxed)
    }
}

// ==========================================
// Link status
// ==========================================

fn carrier_up(name: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{name}/carrier"))
        .map(|s| s.trim() == "1")
        .unwrap_or(false)
}

/// Wait until every interface reports carrier, `timeout` passes or
/// `should_stop` returns true, then log the state of each. Returns whether
/// all links are up.
pub fn wait_for_link(names: &[String], timeout: Duration, should_stop: impl Fn() -> bool) -> bool {
    info!("checking link status");
    let deadline = Instant::now() + timeout;
    let mut all_up = names.iter().all(|n| carrier_up(n));
    while !all_up && Instant::now() < deadline {
        if should_stop() {
            return false;
        }
        std::thread::sleep(LINK_CHECK_INTERVAL);
        all_up = names.iter().all(|n| carrier_up(n));
    }
    for name in names {
        if carrier_up(name) {
            info!(port = %name, "link up");
        } else {
            warn!(port = %name, "link down");
        }
    }
    all_up
}

#[cfg(test)]
mod tests {
    use super::*;

    // AF_UNIX datagram pairs share the recv/send semantics that matter here
    // (MSG_TRUNC, EMSGSIZE, EAGAIN) and need no privileges.
    fn datagram_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: fds has room for the two descriptors socketpair writes.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair: {}", io::Error::last_os_error());
        // SAFETY: both descriptors are fresh and owned by nobody else.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_recv_drops_frames_longer_than_buffer() {
        let (tx, rx) = datagram_pair();
        let mut buf = BytesMut::new();
        assert!(matches!(send_frame(&tx, &[7u8; 4000]), Sent::Sent));
        assert!(matches!(send_frame(&tx, &[9u8; 1500]), Sent::Sent));

        match recv_frame(&rx, &mut buf, 2048).unwrap() {
            Recv::Oversized(len) => assert_eq!(len, 4000),
            other => panic!("expected oversized, got {other:?}"),
        }
        match recv_frame(&rx, &mut buf, 2048).unwrap() {
            Recv::Frame(data) => {
                assert_eq!(data.len(), 1500);
                assert!(data.iter().all(|&b| b == 9));
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(recv_frame(&rx, &mut buf, 2048).unwrap(), Recv::Empty));
    }

    #[test]
    fn test_recv_keeps_jumbo_frames_whole() {
        let (tx, rx) = datagram_pair();
        let mut buf = BytesMut::new();
        let frame: Vec<u8> = (0..9000u32).map(|i| i as u8).collect();
        assert!(matches!(send_frame(&tx, &frame), Sent::Sent));
        assert!(matches!(send_frame(&tx, &[1u8; 64]), Sent::Sent));

        let Recv::Frame(first) = recv_frame(&rx, &mut buf, MAX_FRAME_LEN).unwrap() else {
            panic!("expected the jumbo frame");
        };
        let Recv::Frame(second) = recv_frame(&rx, &mut buf, MAX_FRAME_LEN).unwrap() else {
            panic!("expected the small frame");
        };
        assert_eq!(&first[..], &frame[..]);
        assert_eq!(&second[..], &[1u8; 64][..]);
    }

    #[test]
    fn test_send_separates_refused_from_busy() {
        let (tx, _rx) = datagram_pair();
        let tiny: libc::c_int = 1;
        setsockopt(&tx, libc::SOL_SOCKET, libc::SO_SNDBUF, &tiny).unwrap();

        // Larger than the send buffer can ever hold: EMSGSIZE.
        assert!(matches!(send_frame(&tx, &[0u8; 60_000]), Sent::Refused(_)));

        // Small frames go out until the peer's queue is full.
        let mut sent = 0;
        loop {
            match send_frame(&tx, &[0u8; 64]) {
                Sent::Sent => sent += 1,
                Sent::Busy => break,
                Sent::Refused(err) => panic!("small frame refused: {err}"),
            }
            assert!(sent < 100_000, "peer queue never filled");
        }
        assert!(sent > 0);
    }
}

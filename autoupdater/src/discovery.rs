//! Respondd-style request/response discovery over UDP.
//!
//! A query string is sent once to a (usually multicast) destination and
//! every datagram arriving before the budget runs out is handed to a
//! callback together with the interface it arrived on.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Datagrams larger than this are truncated.
pub const RX_BUFFER_SIZE: usize = 1500;

pub const RESPONDD_PORT: u16 = 1001;

pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

const ANCILLARY_BUFFER_WORDS: usize = 32;

// SO_RCVTIMEO treats a zero timeval as "block forever".
const MIN_RECV_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
  pub source: Ipv6Addr,
  /// Receiving interface; 0 when the kernel supplied no packet info.
  pub ifindex: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
  Continue,
  Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
  /// Budget exhausted or nothing more arrived.
  Done,
  /// The callback asked to stop early.
  Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
  #[error("discovery transport error: {0}")]
  Transport(#[from] io::Error),
  #[error("response handler failed: {0:#}")]
  Handler(anyhow::Error),
}

pub type ResponseHandler<'a> = dyn FnMut(&[u8], &PacketInfo) -> anyhow::Result<ResponseAction> + 'a;

/// The datagram operations the request loop needs.
pub trait DatagramSocket {
  fn send_to(&self, payload: &[u8], dst: &SocketAddrV6) -> io::Result<()>;

  /// Waits at most `timeout` for one datagram. `Ok(None)` means the timeout
  /// elapsed.
  fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, PacketInfo)>>;
}

/// Sends `query` to `dst` and feeds responses to `on_response` until
/// `budget` is used up, the handler cancels, or an error occurs.
///
/// The socket is consumed so it is closed on every exit path. Without a
/// handler the call returns right after sending.
pub fn request<S: DatagramSocket>(
  socket: S,
  dst: &SocketAddrV6,
  query: &str,
  budget: Duration,
  on_response: Option<&mut ResponseHandler<'_>>,
) -> Result<Termination, DiscoveryError> {
  let started = Instant::now();
  socket.send_to(query.as_bytes(), dst)?;
  tracing::debug!(dst = %dst, query, "discovery request sent");

  let Some(on_response) = on_response else {
    return Ok(Termination::Done);
  };

  let mut remaining = budget.saturating_sub(started.elapsed());
  let mut buf = vec![0u8; RX_BUFFER_SIZE];

  loop {
    if remaining.is_zero() {
      return Ok(Termination::Done);
    }

    let iteration = Instant::now();
    buf.fill(0);
    let Some((len, info)) = socket.recv_timeout(&mut buf, remaining)? else {
      return Ok(Termination::Done);
    };

    match on_response(&buf[..len], &info) {
      Ok(ResponseAction::Continue) => {}
      Ok(ResponseAction::Cancel) => {
        tracing::debug!(dst = %dst, "discovery cancelled by handler");
        return Ok(Termination::Cancelled);
      }
      Err(e) => return Err(DiscoveryError::Handler(e)),
    }

    remaining = remaining.saturating_sub(iteration.elapsed());
  }
}

/// Unconnected IPv6 UDP socket that reports the receiving interface of
/// each datagram.
pub struct PktInfoSocket {
  socket: Socket,
}

impl PktInfoSocket {
  pub fn open() -> io::Result<Self> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    let one: libc::c_int = 1;
    // SAFETY: the fd is owned by `socket` and stays open for the call; the
    // option value points to a live c_int of the advertised length.
    let rc = unsafe {
      libc::setsockopt(
        socket.as_raw_fd(),
        libc::IPPROTO_IPV6,
        libc::IPV6_RECVPKTINFO,
        &one as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
      )
    };
    if rc != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(Self { socket })
  }
}

impl DatagramSocket for PktInfoSocket {
  fn send_to(&self, payload: &[u8], dst: &SocketAddrV6) -> io::Result<()> {
    self.socket.send_to(payload, &SockAddr::from(*dst))?;
    Ok(())
  }

  fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, PacketInfo)>> {
    self.socket.set_read_timeout(Some(timeout.max(MIN_RECV_TIMEOUT)))?;

    loop {
      match recv_with_pktinfo(self.socket.as_raw_fd(), buf) {
        Ok(v) => return Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => return Ok(None),
        Err(e) => return Err(e),
      }
    }
  }
}

fn recv_with_pktinfo(fd: libc::c_int, buf: &mut [u8]) -> io::Result<(usize, PacketInfo)> {
  // u64 words keep the control buffer aligned for cmsghdr.
  let mut ancillary = [0u64; ANCILLARY_BUFFER_WORDS];

  // SAFETY: every pointer stored in `hdr` refers to a local that outlives
  // the recvmsg call, with the matching length. The cmsg walk only follows
  // headers the kernel wrote inside `ancillary`, bounded by msg_controllen,
  // and the pktinfo payload is read unaligned.
  unsafe {
    let mut src: libc::sockaddr_in6 = mem::zeroed();
    let mut iov = libc::iovec {
      iov_base: buf.as_mut_ptr() as *mut libc::c_void,
      iov_len: buf.len(),
    };

    let mut hdr: libc::msghdr = mem::zeroed();
    hdr.msg_name = &mut src as *mut libc::sockaddr_in6 as *mut libc::c_void;
    hdr.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1 as _;
    hdr.msg_control = ancillary.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = mem::size_of_val(&ancillary) as _;

    let len = libc::recvmsg(fd, &mut hdr, 0);
    if len < 0 {
      return Err(io::Error::last_os_error());
    }

    let mut ifindex = 0u32;
    let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
    while !cmsg.is_null() {
      if (*cmsg).cmsg_level == libc::IPPROTO_IPV6 && (*cmsg).cmsg_type == libc::IPV6_PKTINFO {
        let info = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
        ifindex = info.ipi6_ifindex as u32;
      }
      cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
    }

    let info = PacketInfo {
      source: Ipv6Addr::from(src.sin6_addr.s6_addr),
      ifindex,
    };
    Ok((len as usize, info))
  }
}

/// Something that can run one discovery request. The neighbour directory
/// is written against this so it can be driven without real sockets.
pub trait Requester {
  fn request(
    &self,
    dst: &SocketAddrV6,
    query: &str,
    budget: Duration,
    on_response: Option<&mut ResponseHandler<'_>>,
  ) -> Result<Termination, DiscoveryError>;
}

/// Opens a fresh [`PktInfoSocket`] per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpRequester;

impl Requester for UdpRequester {
  fn request(
    &self,
    dst: &SocketAddrV6,
    query: &str,
    budget: Duration,
    on_response: Option<&mut ResponseHandler<'_>>,
  ) -> Result<Termination, DiscoveryError> {
    let socket = PktInfoSocket::open()?;
    request(socket, dst, query, budget, on_response)
  }
}

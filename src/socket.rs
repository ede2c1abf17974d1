//! Socket construction and control-message plumbing
//!
//! This module builds the relay's sockets with the platform options the
//! engine expects and wraps the `recvmsg`/`sendmsg` ancillary-data
//! plumbing used by the UDP relay:
//!
//! - TCP listeners/dialers: optional TCP Fast Open and `SO_MARK`.
//! - UDP sockets: `IP_MTU_DISCOVER = DO` (disable fragmentation),
//!   `IP_PKTINFO`/`IPV6_RECVPKTINFO` on server sockets, optional `SO_MARK`.
//! - [`recv_msg`]/[`send_msg`]: receive with packet-info control messages
//!   and echo them back on replies, so responses leave with the source
//!   address the client originally targeted.
//!
//! All Linux-only options degrade silently on other platforms: the
//! capability is simply absent and the cached packet info stays empty.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use crate::error::SocketError;

#[cfg(target_os = "linux")]
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;

/// Options for client-facing TCP listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpListenerOpts {
    /// Enable TCP Fast Open on the listener
    pub fastopen: bool,
    /// Firewall mark for all accepted connections (0 = unset)
    pub fwmark: u32,
}

/// Options for outbound TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialerOpts {
    /// Enable TCP Fast Open on the dialer (data rides the SYN)
    pub fastopen: bool,
    /// Firewall mark (0 = unset)
    pub fwmark: u32,
}

/// Options for UDP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpSocketOpts {
    /// Request packet-info control messages (server sockets)
    pub pktinfo: bool,
    /// Firewall mark (0 = unset)
    pub fwmark: u32,
}

/// TCP Fast Open server queue length.
#[cfg(target_os = "linux")]
const TCP_FASTOPEN_QLEN: libc::c_int = 1024;

/// Create a TCP listener with the requested options applied.
///
/// # Errors
///
/// Returns [`SocketError`] if socket creation or binding fails. Option
/// failures on unsupported kernels are downgraded to debug logs.
pub fn listen_tcp(addr: SocketAddr, opts: TcpListenerOpts) -> Result<TcpListener, SocketError> {
    let domain = Domain::for_address(addr);
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(SocketError::Create)?;

    socket
        .set_reuse_address(true)
        .map_err(|e| SocketError::option("SO_REUSEADDR", e.to_string()))?;

    if opts.fwmark != 0 {
        if let Err(e) = set_fwmark(&socket, opts.fwmark) {
            return Err(SocketError::option("SO_MARK", e.to_string()));
        }
    }

    if opts.fastopen {
        if let Err(e) = set_tcp_fastopen(&socket) {
            // TFO is a capability flag; absence is not fatal.
            debug!(%addr, error = %e, "TCP_FASTOPEN not applied");
        }
    }

    socket
        .bind(&addr.into())
        .map_err(|source| SocketError::Bind { addr, source })?;
    socket
        .listen(1024)
        .map_err(|source| SocketError::Bind { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|e| SocketError::option("O_NONBLOCK", e.to_string()))?;

    TcpListener::from_std(socket.into()).map_err(SocketError::Create)
}

/// Dial a TCP connection with the requested options applied.
///
/// # Errors
///
/// Returns an I/O error if socket setup or the connect itself fails.
pub async fn dial_tcp(addr: SocketAddr, opts: TcpDialerOpts) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(target_os = "linux")]
    {
        let fd = socket.as_raw_fd();
        if opts.fwmark != 0 {
            set_sockopt_int(fd, libc::SOL_SOCKET, libc::SO_MARK, opts.fwmark as libc::c_int)?;
        }
        if opts.fastopen {
            if let Err(e) =
                set_sockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN_CONNECT, 1)
            {
                debug!(%addr, error = %e, "TCP_FASTOPEN_CONNECT not applied");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = opts;

    socket.connect(addr).await
}

/// Create a UDP socket bound to `addr` with the requested options.
///
/// Mirrors the server-socket contract: a hard failure aborts, but an
/// option that could not be applied is reported back as a warning so
/// the caller can log it and keep the socket.
///
/// # Errors
///
/// Returns [`SocketError`] if socket creation or binding fails.
pub fn listen_udp(
    addr: SocketAddr,
    opts: UdpSocketOpts,
) -> Result<(UdpSocket, Option<SocketError>), SocketError> {
    let domain = Domain::for_address(addr);
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(SocketError::Create)?;

    if addr.is_ipv6() {
        // Dual-stack: the relay keys sessions by v4-mapped-v6 addresses.
        let _ = socket.set_only_v6(false);
    }

    let mut warning = None;

    #[cfg(target_os = "linux")]
    {
        let fd = socket.as_raw_fd();

        if let Err(e) = set_sockopt_int(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DO,
        ) {
            warning = Some(SocketError::option("IP_MTU_DISCOVER", e.to_string()));
        }
        if addr.is_ipv6() {
            if let Err(e) = set_sockopt_int(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MTU_DISCOVER,
                libc::IP_PMTUDISC_DO,
            ) {
                warning = Some(SocketError::option("IPV6_MTU_DISCOVER", e.to_string()));
            }
        }

        if opts.pktinfo {
            if addr.is_ipv4() {
                if let Err(e) = set_sockopt_int(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1) {
                    warning = Some(SocketError::option("IP_PKTINFO", e.to_string()));
                }
            } else if let Err(e) =
                set_sockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)
            {
                warning = Some(SocketError::option("IPV6_RECVPKTINFO", e.to_string()));
            }
        }

        if opts.fwmark != 0 {
            if let Err(e) =
                set_sockopt_int(fd, libc::SOL_SOCKET, libc::SO_MARK, opts.fwmark as libc::c_int)
            {
                warning = Some(SocketError::option("SO_MARK", e.to_string()));
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = opts;

    socket
        .bind(&addr.into())
        .map_err(|source| SocketError::Bind { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|e| SocketError::option("O_NONBLOCK", e.to_string()))?;

    let socket = UdpSocket::from_std(socket.into()).map_err(SocketError::Create)?;
    Ok((socket, warning))
}

/// Create an unbound-port outbound UDP socket for a NAT session.
///
/// Binds the wildcard address of `peer`'s family so the socket can reach
/// the session's upstream; applies the firewall mark when requested.
///
/// # Errors
///
/// Returns [`SocketError`] if socket creation fails.
pub fn bind_udp_outbound(peer: SocketAddr, fwmark: u32) -> Result<UdpSocket, SocketError> {
    let wildcard: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse().expect("wildcard v4")
    } else {
        "[::]:0".parse().expect("wildcard v6")
    };
    let (socket, warning) = listen_udp(
        wildcard,
        UdpSocketOpts {
            pktinfo: false,
            fwmark,
        },
    )?;
    if let Some(w) = warning {
        debug!(error = %w, "outbound UDP socket option not applied");
    }
    Ok(socket)
}

/// Packet-info ancillary data cached per session and echoed on replies.
///
/// At most one entry per address family; merging is last-one-wins per
/// family, so a client that migrates between interfaces keeps a
/// coherent reply path. Empty on platforms without packet-info support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pktinfo {
    #[cfg(target_os = "linux")]
    v4: Option<(Ipv4Addr, u32)>,
    #[cfg(target_os = "linux")]
    v6: Option<(Ipv6Addr, u32)>,
}

impl Pktinfo {
    /// True when no packet info has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.v4.is_none() && self.v6.is_none()
        }
        #[cfg(not(target_os = "linux"))]
        {
            true
        }
    }

    /// Merge newly received packet info into this cache.
    pub fn merge(&mut self, other: Self) {
        #[cfg(target_os = "linux")]
        {
            if other.v4.is_some() {
                self.v4 = other.v4;
            }
            if other.v6.is_some() {
                self.v6 = other.v6;
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = other;
    }
}

/// One datagram received with ancillary data.
#[derive(Debug)]
pub struct RecvMsg {
    /// Payload length written into the caller's buffer
    pub len: usize,
    /// Source address of the datagram
    pub src: SocketAddr,
    /// Packet info parsed from control messages (empty off-Linux)
    pub pktinfo: Pktinfo,
}

/// Receive one datagram together with its packet-info control messages.
///
/// Truncated datagrams (`MSG_TRUNC`) and truncated control buffers
/// (`MSG_CTRUNC`) are rejected with `InvalidData`.
///
/// # Errors
///
/// Returns the underlying socket error; `InvalidData` for truncation.
#[cfg(target_os = "linux")]
pub async fn recv_msg(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvMsg> {
    loop {
        socket.readable().await?;

        match socket.try_io(tokio::io::Interest::READABLE, || raw_recvmsg(socket, buf)) {
            Ok(msg) => return Ok(msg),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
}

/// Receive one datagram (no ancillary data on this platform).
#[cfg(not(target_os = "linux"))]
pub async fn recv_msg(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvMsg> {
    let (len, src) = socket.recv_from(buf).await?;
    Ok(RecvMsg {
        len,
        src,
        pktinfo: Pktinfo::default(),
    })
}

/// Send one datagram, echoing cached packet info as ancillary data.
///
/// With an empty cache (or off-Linux) this is a plain `send_to`; the
/// kernel then picks the source address itself.
///
/// # Errors
///
/// Returns the underlying socket error.
pub async fn send_msg(
    socket: &UdpSocket,
    buf: &[u8],
    dst: SocketAddr,
    pktinfo: Pktinfo,
) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    {
        if !pktinfo.is_empty() {
            loop {
                socket.writable().await?;
                match socket.try_io(tokio::io::Interest::WRITABLE, || {
                    raw_sendmsg(socket, buf, dst, pktinfo)
                }) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = pktinfo;

    socket.send_to(buf, dst).await
}

#[cfg(target_os = "linux")]
fn set_sockopt_int(
    fd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            libc::socklen_t::try_from(std::mem::size_of::<libc::c_int>()).unwrap(),
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_fwmark(socket: &Socket, fwmark: u32) -> io::Result<()> {
    socket.set_mark(fwmark)
}

#[cfg(not(target_os = "linux"))]
fn set_fwmark(_socket: &Socket, _fwmark: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_tcp_fastopen(socket: &Socket) -> io::Result<()> {
    set_sockopt_int(
        socket.as_raw_fd(),
        libc::IPPROTO_TCP,
        libc::TCP_FASTOPEN,
        TCP_FASTOPEN_QLEN,
    )
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_fastopen(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP_FASTOPEN is not supported on this platform",
    ))
}

/// Control message buffer size: one cmsghdr plus an `in6_pktinfo` is
/// the largest thing we expect, rounded up generously.
#[cfg(target_os = "linux")]
const CMSG_BUFFER_SIZE: usize = 64;

#[cfg(target_os = "linux")]
#[allow(clippy::cast_sign_loss)] // n is checked non-negative
fn raw_recvmsg(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvMsg> {
    let fd = socket.as_raw_fd();

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut src_addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = libc::socklen_t::try_from(std::mem::size_of::<libc::sockaddr_storage>())
        .unwrap();
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // A truncated datagram or control buffer would hand the framing a
    // packet it cannot authenticate; reject both outright.
    if (msg.msg_flags & libc::MSG_TRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram truncated (MSG_TRUNC)",
        ));
    }
    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated (MSG_CTRUNC)",
        ));
    }

    let src = sockaddr_to_socket_addr(&src_addr)?;
    let pktinfo = parse_pktinfo_cmsgs(&msg);

    Ok(RecvMsg {
        len: n as usize,
        src,
        pktinfo,
    })
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_sign_loss)] // n is checked non-negative
#[allow(clippy::cast_possible_truncation)] // cmsg lengths fit their types
fn raw_sendmsg(
    socket: &UdpSocket,
    buf: &[u8],
    dst: SocketAddr,
    pktinfo: Pktinfo,
) -> io::Result<usize> {
    let fd = socket.as_raw_fd();

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let (mut dst_addr, dst_len) = socket_addr_to_sockaddr(dst);
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(dst_addr).cast::<libc::c_void>();
    msg.msg_namelen = dst_len;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;

    // Echo the cached packet info for the destination's family so the
    // reply leaves with the source address the client sent to.
    let control_len = if crate::addr::is_ipv4_or_mapped(dst) {
        pktinfo
            .v4
            .map(|(addr, ifindex)| unsafe {
                build_v4_pktinfo_cmsg(&mut cmsg_buf, &mut msg, addr, ifindex)
            })
            .unwrap_or(0)
    } else {
        pktinfo
            .v6
            .map(|(addr, ifindex)| unsafe {
                build_v6_pktinfo_cmsg(&mut cmsg_buf, &mut msg, addr, ifindex)
            })
            .unwrap_or(0)
    };
    if control_len > 0 {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = control_len;
    }

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(target_os = "linux")]
unsafe fn build_v4_pktinfo_cmsg(
    cmsg_buf: &mut [u8; CMSG_BUFFER_SIZE],
    msg: &mut libc::msghdr,
    addr: Ipv4Addr,
    ifindex: u32,
) -> usize {
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE;

    let cmsg = libc::CMSG_FIRSTHDR(msg);
    (*cmsg).cmsg_level = libc::IPPROTO_IP;
    (*cmsg).cmsg_type = libc::IP_PKTINFO;
    (*cmsg).cmsg_len =
        libc::CMSG_LEN(std::mem::size_of::<libc::in_pktinfo>() as libc::c_uint) as usize;

    let pktinfo = libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>();
    (*pktinfo).ipi_ifindex = ifindex as libc::c_int;
    (*pktinfo).ipi_spec_dst = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    (*pktinfo).ipi_addr = libc::in_addr { s_addr: 0 };

    libc::CMSG_SPACE(std::mem::size_of::<libc::in_pktinfo>() as libc::c_uint) as usize
}

#[cfg(target_os = "linux")]
unsafe fn build_v6_pktinfo_cmsg(
    cmsg_buf: &mut [u8; CMSG_BUFFER_SIZE],
    msg: &mut libc::msghdr,
    addr: Ipv6Addr,
    ifindex: u32,
) -> usize {
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE;

    let cmsg = libc::CMSG_FIRSTHDR(msg);
    (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
    (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
    (*cmsg).cmsg_len =
        libc::CMSG_LEN(std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint) as usize;

    let pktinfo = libc::CMSG_DATA(cmsg).cast::<libc::in6_pktinfo>();
    (*pktinfo).ipi6_ifindex = ifindex;
    (*pktinfo).ipi6_addr = libc::in6_addr {
        s6_addr: addr.octets(),
    };

    libc::CMSG_SPACE(std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint) as usize
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_ptr_alignment)] // cmsg data alignment is guaranteed by CMSG_DATA
fn parse_pktinfo_cmsgs(msg: &libc::msghdr) -> Pktinfo {
    let mut info = Pktinfo::default();

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let cmsg_ref = unsafe { &*cmsg };

        if cmsg_ref.cmsg_level == libc::IPPROTO_IP && cmsg_ref.cmsg_type == libc::IP_PKTINFO {
            let pktinfo = unsafe { &*libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>() };
            let addr = Ipv4Addr::from(u32::from_be(pktinfo.ipi_spec_dst.s_addr));
            #[allow(clippy::cast_sign_loss)]
            let ifindex = pktinfo.ipi_ifindex as u32;
            info.v4 = Some((addr, ifindex));
        } else if cmsg_ref.cmsg_level == libc::IPPROTO_IPV6
            && cmsg_ref.cmsg_type == libc::IPV6_PKTINFO
        {
            let pktinfo = unsafe { &*libc::CMSG_DATA(cmsg).cast::<libc::in6_pktinfo>() };
            let addr = Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr);
            info.v6 = Some((addr, pktinfo.ipi6_ifindex));
        }

        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }

    info
}

#[cfg(target_os = "linux")]
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let addr4 = unsafe {
                &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in>()
            };
            let ip = Ipv4Addr::from(u32::from_be(addr4.sin_addr.s_addr));
            let port = u16::from_be(addr4.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr6 = unsafe {
                &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>()
            };
            let ip = Ipv6Addr::from(addr6.sin6_addr.s6_addr);
            let port = u16::from_be(addr6.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr6.sin6_flowinfo,
                addr6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad sockaddr family: {family}"),
        )),
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)] // sockaddr sizes fit in socklen_t
fn socket_addr_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let addr4 = unsafe {
                &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>()
            };
            addr4.sin_family = libc::AF_INET as libc::sa_family_t;
            addr4.sin_port = v4.port().to_be();
            addr4.sin_addr = libc::in_addr {
                s_addr: u32::from(*v4.ip()).to_be(),
            };
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let addr6 = unsafe {
                &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>()
            };
            addr6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            addr6.sin6_port = v6.port().to_be();
            addr6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            addr6.sin6_flowinfo = v6.flowinfo();
            addr6.sin6_scope_id = v6.scope_id();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

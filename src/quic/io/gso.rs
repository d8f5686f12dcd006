// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Batched UDP sends with generic segmentation offload.

use std::io;
use std::net::SocketAddr;

use foundations::telemetry::metrics::Counter;
use foundations::telemetry::metrics::TimeHistogram;

#[cfg(target_os = "linux")]
mod linux_imports {
    pub(super) use nix::sys::socket::sendmsg;
    pub(super) use nix::sys::socket::ControlMessage;
    pub(super) use nix::sys::socket::MsgFlags;
    pub(super) use nix::sys::socket::SockaddrStorage;
    pub(super) use smallvec::SmallVec;
    pub(super) use std::io::ErrorKind;
    pub(super) use std::os::fd::AsRawFd;
    pub(super) use tokio::io::Interest;
}

#[cfg(target_os = "linux")]
use self::linux_imports::*;

/// Maximum number of packets that can be sent in one UDP GSO batch.
pub(crate) const UDP_MAX_SEGMENT_COUNT: usize = 64;

/// Size of the scratch buffer a GSO batch is assembled in.
pub(crate) const UDP_MAX_GSO_PACKET_SIZE: usize = 64 * 1024;

/// Returns a new max send buffer size to avoid fragmentation at the end.
/// The maximum send buffer size is min(`max_capacity`, connection's
/// `send_quantum`), rounded down to a multiple of the segment size so the
/// batch never ends in a runt packet.
pub(crate) fn tune_max_send_size(
    segment_size: Option<usize>, send_quantum: usize, max_capacity: usize,
) -> usize {
    let max_send_buf_size = send_quantum.min(max_capacity);

    if let Some(mss) = segment_size {
        max_send_buf_size / mss * mss
    } else {
        max_send_buf_size
    }
}

/// Reports whether a `sendmsg` failure means the datagram was too large for
/// the path, in which case the caller should lower its UDP payload cap.
pub(crate) fn is_packet_too_large(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EMSGSIZE)
    )
}

#[cfg(target_os = "linux")]
#[derive(Copy, Clone, Debug)]
pub(crate) enum PktInfo {
    V4(libc::in_pktinfo),
    V6(libc::in6_pktinfo),
}

#[cfg(target_os = "linux")]
impl PktInfo {
    fn make_cmsg(&'_ self) -> ControlMessage<'_> {
        match self {
            Self::V4(pkt) => ControlMessage::Ipv4PacketInfo(pkt),
            Self::V6(pkt) => ControlMessage::Ipv6PacketInfo(pkt),
        }
    }

    fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(ipv4) => {
                // The raw octets become a native-endian, kernel-readable u32.
                let s_addr = u32::from_ne_bytes(ipv4.ip().octets());

                Self::V4(libc::in_pktinfo {
                    ipi_ifindex: 0,
                    ipi_spec_dst: libc::in_addr { s_addr },
                    ipi_addr: libc::in_addr { s_addr: 0 },
                })
            },
            SocketAddr::V6(ipv6) => Self::V6(libc::in6_pktinfo {
                ipi6_ifindex: 0,
                ipi6_addr: libc::in6_addr {
                    s6_addr: ipv6.ip().octets(),
                },
            }),
        }
    }
}

/// Sends `send_buf` to `to`, segmented into `segment_size`d packets by the
/// kernel.
///
/// The optional `from` address is attached as a `PKTINFO` control message so
/// replies leave from the address the peer actually contacted.
#[cfg(target_os = "linux")]
pub(crate) async fn send_to(
    socket: &tokio::net::UdpSocket, to: SocketAddr, from: Option<SocketAddr>,
    send_buf: &[u8], segment_size: usize, would_block_metric: Counter,
    send_to_wouldblock_duration_s: TimeHistogram,
) -> io::Result<usize> {
    let iov = [std::io::IoSlice::new(send_buf)];
    let segment_size_u16 = segment_size as u16;

    let pkt_info = from.map(PktInfo::from_socket_addr);

    let mut cmsgs: SmallVec<[ControlMessage; 2]> = SmallVec::new();

    // Create cmsg for UDP_SEGMENT.
    cmsgs.push(ControlMessage::UdpGsoSegments(&segment_size_u16));

    if let Some(pkt) = pkt_info.as_ref() {
        // Create cmsg for IP(V6)_PKTINFO.
        cmsgs.push(pkt.make_cmsg());
    }

    let addr = SockaddrStorage::from(to);

    let mut sendmsg_retry_timer = None;
    loop {
        // Must use [`try_io`] so tokio can properly clear its readiness flag
        let res = socket.try_io(Interest::WRITABLE, || {
            let fd = socket.as_raw_fd();
            sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&addr))
                .map_err(Into::into)
        });

        match res {
            // Wait for the socket to become writable and try again
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if sendmsg_retry_timer.is_none() {
                    sendmsg_retry_timer =
                        Some(send_to_wouldblock_duration_s.start_timer());
                }
                would_block_metric.inc();
                socket.writable().await?
            },
            res => return res,
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn send_to(
    socket: &tokio::net::UdpSocket, to: SocketAddr, _from: Option<SocketAddr>,
    send_buf: &[u8], _segment_size: usize, _would_block_metric: Counter,
    _send_to_wouldblock_duration_s: TimeHistogram,
) -> io::Result<usize> {
    socket.send_to(send_buf, to).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_size_is_segment_aligned() {
        assert_eq!(tune_max_send_size(Some(100), 1000, 4096), 1000);
        assert_eq!(tune_max_send_size(Some(90), 1000, 4096), 990);
        assert_eq!(tune_max_send_size(None, 1000, 4096), 1000);
        assert_eq!(tune_max_send_size(Some(100), 8192, 4096), 4000);
    }

    #[test]
    fn too_large_classification() {
        assert!(is_packet_too_large(&io::Error::from_raw_os_error(
            libc::EMSGSIZE
        )));
        assert!(is_packet_too_large(&io::Error::from_raw_os_error(
            libc::EINVAL
        )));
        assert!(!is_packet_too_large(&io::Error::from_raw_os_error(
            libc::ECONNREFUSED
        )));
    }
}

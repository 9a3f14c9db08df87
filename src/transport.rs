//! 데이터그램 전송 계층
//!
//! 프로토콜 코어는 [`Transport`]로만 송신한다. 수신은 세션의 수신 루프가 담당.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::info;

use crate::Result;

/// 송신 창구
pub trait Transport: Send + Sync {
    /// 멀티캐스트 그룹으로 송신 (패킷별 TTL)
    fn send(&self, buf: &[u8], ttl: u8) -> io::Result<()>;

    /// 로컬 주소 (자기 자신이 보낸 패킷 판별용)
    fn local_ip(&self) -> IpAddr;
}

/// IPv4 멀티캐스트 UDP 소켓
pub struct UdpTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
    local_ip: IpAddr,
    /// 소켓에 설정된 현재 TTL (설정 + 송신을 한 번에)
    ttl: Mutex<u8>,
}

impl UdpTransport {
    /// 그룹 가입 (tokio 런타임 안에서 호출)
    ///
    /// `interface`가 UNSPECIFIED면 OS 기본 인터페이스를 쓴다.
    pub fn join(group: Ipv4Addr, port: u16, interface: Ipv4Addr, ttl: u8) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // 같은 호스트의 여러 참여자가 같은 포트를 공유
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.join_multicast_v4(&group, &interface)?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)?;
        }
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(ttl as u32)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        let group = SocketAddrV4::new(group, port);
        let local_ip = if interface.is_unspecified() {
            route_ip(SocketAddr::V4(group))?
        } else {
            IpAddr::V4(interface)
        };

        info!("멀티캐스트 그룹 가입: {} (로컬 {}, TTL {})", group, local_ip, ttl);

        Ok(Self {
            socket,
            group,
            local_ip,
            ttl: Mutex::new(ttl),
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

impl Transport for UdpTransport {
    fn send(&self, buf: &[u8], ttl: u8) -> io::Result<()> {
        let mut current = self.ttl.lock();
        if *current != ttl {
            self.socket.set_multicast_ttl_v4(ttl as u32)?;
            *current = ttl;
        }
        self.socket.try_send_to(buf, SocketAddr::V4(self.group))?;
        Ok(())
    }

    fn local_ip(&self) -> IpAddr {
        self.local_ip
    }
}

/// `dest`로 나갈 때 쓰일 로컬 주소 (실제 송신 없음)
pub fn route_ip(dest: SocketAddr) -> io::Result<IpAddr> {
    let probe = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(dest)?;
    Ok(probe.local_addr()?.ip())
}

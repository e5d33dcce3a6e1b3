//! Type-safe network primitives for the NetSys protocol engine.
//!
//! Newtype wrappers keep byte order and identifier kinds apart at compile
//! time. All wrappers are `#[repr(transparent)]` and zero cost.

use core::fmt;

// =============================================================================
// Addresses and ports
// =============================================================================

/// IPv4 address stored in **network byte order** (`[u8; 4]`).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// `0.0.0.0`, the wildcard address.
    pub const ANY: Self = Self([0, 0, 0, 0]);
    /// `255.255.255.255`, the limited broadcast address.
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);

    #[inline]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Construct from a big-endian `u32`, the form carried in IPC words.
    #[inline]
    pub const fn from_u32_be(val: u32) -> Self {
        Self(val.to_be_bytes())
    }

    #[inline]
    pub const fn to_u32_be(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub const fn is_any(&self) -> bool {
        self.to_u32_be() == 0
    }

    /// `true` if the address is in the multicast range `224.0.0.0/4`.
    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// `true` for the limited broadcast, the any address, and the directed
    /// broadcast of the subnet described by `netif_ip`/`netmask`.
    pub const fn is_broadcast_on(&self, netif_ip: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        let a = self.to_u32_be();
        let m = netmask.to_u32_be();
        if a == u32::MAX || a == 0 {
            return true;
        }
        (a & m) == (netif_ip.to_u32_be() & m) && (a & !m) == !m
    }

    #[inline]
    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Port number in **host byte order**.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Port(pub u16);

impl Port {
    /// Port 0: "pick one for me" on bind, wildcard on match.
    pub const ANY: Self = Self(0);

    #[inline]
    pub const fn new(val: u16) -> Self {
        Self(val)
    }

    #[inline]
    pub const fn is_any(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn to_network_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub const fn from_network_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier supplied by the capability layer. Zero is never a
/// valid session.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ssid(pub u32);

impl Ssid {
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssid#{}", self.0)
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// IP protocol numbers
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl IpProtocol {
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }
}

// =============================================================================
// NetError
// =============================================================================

/// Protocol engine error type.
///
/// Session-boundary code converts these into result codes; nothing below the
/// session layer knows about result codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// A pbuf could not be allocated.
    NoBufs,
    /// A fixed object pool or the arena is exhausted.
    NoMemory,
    /// The local port is owned by another PCB.
    AddrInUse,
    /// The PCB is in the wrong state for the request.
    NotConnected,
    /// Already connected or listening.
    AlreadyConnected,
    /// Send buffer or send queue is full.
    SendBufferFull,
    /// The peer reset the connection.
    ConnectionReset,
    /// The connection was aborted locally.
    ConnectionAborted,
    /// The peer closed its side.
    Closed,
    /// Handshake or wait deadline expired.
    TimedOut,
    /// Malformed or undeliverable packet.
    InvalidPacket,
    /// Bad handle or argument.
    InvalidArgument,
    /// The IP layer could not send.
    Unreachable,
    /// The payload does not fit in one datagram.
    MessageTooLong,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBufs => write!(f, "out of packet buffers"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::AddrInUse => write!(f, "address already in use"),
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::SendBufferFull => write!(f, "send buffer full"),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::ConnectionAborted => write!(f, "connection aborted"),
            Self::Closed => write!(f, "connection closed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::InvalidPacket => write!(f, "invalid packet"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Unreachable => write!(f, "destination unreachable"),
            Self::MessageTooLong => write!(f, "message too long"),
        }
    }
}

pub type NetResult<T = ()> = Result<T, NetError>;

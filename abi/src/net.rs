use core::fmt;

// =============================================================================
// Request opcodes
// =============================================================================

/// Operation codes of the NetSys session capability.
///
/// The session id travels alongside the opcode; `w1`/`w2` carry addresses,
/// ports, timeouts and flags depending on the request.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetSysOp {
    UdpConnect = 1,
    UdpBind = 2,
    UdpSend = 3,
    UdpReceive = 4,
    UdpClose = 5,
    IcmpOpen = 16,
    IcmpPing = 17,
    IcmpReceive = 18,
    IcmpClose = 19,
    TcpListen = 32,
    TcpBind = 33,
    TcpConnect = 34,
    TcpSend = 35,
    TcpReceive = 36,
    TcpClose = 37,
}

impl NetSysOp {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::UdpConnect,
            2 => Self::UdpBind,
            3 => Self::UdpSend,
            4 => Self::UdpReceive,
            5 => Self::UdpClose,
            16 => Self::IcmpOpen,
            17 => Self::IcmpPing,
            18 => Self::IcmpReceive,
            19 => Self::IcmpClose,
            32 => Self::TcpListen,
            33 => Self::TcpBind,
            34 => Self::TcpConnect,
            35 => Self::TcpSend,
            36 => Self::TcpReceive,
            37 => Self::TcpClose,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::UdpConnect => "UDPConnect",
            Self::UdpBind => "UDPBind",
            Self::UdpSend => "UDPSend",
            Self::UdpReceive => "UDPReceive",
            Self::UdpClose => "UDPClose",
            Self::IcmpOpen => "ICMPOpen",
            Self::IcmpPing => "ICMPPing",
            Self::IcmpReceive => "ICMPReceive",
            Self::IcmpClose => "ICMPClose",
            Self::TcpListen => "tcp_listen",
            Self::TcpBind => "tcp_bind",
            Self::TcpConnect => "tcp_connect",
            Self::TcpSend => "TCPSend",
            Self::TcpReceive => "TCPReceive",
            Self::TcpClose => "tcp_close",
        }
    }
}

// =============================================================================
// Result codes
// =============================================================================

/// Result codes returned in the reply word of every NetSys request.
///
/// `Ok` is zero; everything else is a distinct, stable value.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok = 0,
    PortInUse = 0x100,
    MempExhausted = 0x101,
    NoExistingSession = 0x102,
    PbufsExhausted = 0x103,
    UdpReceiveTimedOut = 0x104,
    UdpNoBind = 0x105,
    TcpAlreadyConnected = 0x106,
    TcpConnectFailed = 0x107,
    TcpConnectTimedOut = 0x108,
    PingReplySuccess = 0x109,
    Closed = 0x10a,
    SessionsExhausted = 0x10b,
    TcpNotConnected = 0x10c,
    TcpSendBufferFull = 0x10d,
    UnknownRequest = 0x1ff,
}

impl ResultCode {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            0x100 => Self::PortInUse,
            0x101 => Self::MempExhausted,
            0x102 => Self::NoExistingSession,
            0x103 => Self::PbufsExhausted,
            0x104 => Self::UdpReceiveTimedOut,
            0x105 => Self::UdpNoBind,
            0x106 => Self::TcpAlreadyConnected,
            0x107 => Self::TcpConnectFailed,
            0x108 => Self::TcpConnectTimedOut,
            0x109 => Self::PingReplySuccess,
            0x10a => Self::Closed,
            0x10b => Self::SessionsExhausted,
            0x10c => Self::TcpNotConnected,
            0x10d => Self::TcpSendBufferFull,
            0x1ff => Self::UnknownRequest,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::PingReplySuccess)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "RC_OK",
            Self::PortInUse => "RC_NetSys_PortInUse",
            Self::MempExhausted => "RC_NetSys_MEMPExhausted",
            Self::NoExistingSession => "RC_NetSys_NoExistingSession",
            Self::PbufsExhausted => "RC_NetSys_PbufsExhausted",
            Self::UdpReceiveTimedOut => "RC_NetSys_UDPReceiveTimedOut",
            Self::UdpNoBind => "RC_NetSys_UDPNoBind",
            Self::TcpAlreadyConnected => "RC_NetSys_TCPAlreadyConnected",
            Self::TcpConnectFailed => "RC_NetSys_TCPConnectFailed",
            Self::TcpConnectTimedOut => "RC_NetSys_TCPConnectTimedOut",
            Self::PingReplySuccess => "RC_NetSys_PingReplySuccess",
            Self::Closed => "RC_NetSys_Closed",
            Self::SessionsExhausted => "RC_NetSys_SessionsExhausted",
            Self::TcpNotConnected => "RC_NetSys_TCPNotConnected",
            Self::TcpSendBufferFull => "RC_NetSys_TCPSendBufferFull",
            Self::UnknownRequest => "RC_UnknownRequest",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Maximum number of concurrently open sessions.
pub const MAX_SESSIONS: usize = 32;

/// Maximum number of concurrently open ICMP sessions.
pub const MAX_ICMP_SESSIONS: usize = 8;

/// Size of the port ownership bitmap (one bit per 16-bit port).
pub const MAX_PORTS: usize = 65536;

/// Granularity of the session timeout sweep, in milliseconds.
pub const TIMEOUT_AGENT_GRANULARITY_MS: u32 = 10;

/// `TCPSend` flag word: copy the caller's bytes into stack-owned buffers.
pub const TCP_SEND_COPY: u32 = 1;

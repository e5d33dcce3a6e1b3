//! Stack tunables.
//!
//! Compile-time defaults live in the constants below; [`NetConfig`] carries
//! the subset that sizes memory so that tests can build small stacks.

use netsys_abi::net::{MAX_ICMP_SESSIONS, MAX_SESSIONS};

// =============================================================================
// Memory
// =============================================================================

/// Size of the arena backing `PBUF_RAM` buffers.
pub const MEM_SIZE: usize = 1024 * 1024;

/// Alignment of every arena allocation.
pub const MEM_ALIGNMENT: usize = 4;

/// Number of pbuf metadata slots (ROM/REF pbufs).
pub const MEMP_NUM_PBUF: usize = 100;
pub const MEMP_NUM_UDP_PCB: usize = 4;
pub const MEMP_NUM_TCP_PCB: usize = 7;
pub const MEMP_NUM_TCP_PCB_LISTEN: usize = 10;
pub const MEMP_NUM_TCP_SEG: usize = 50;

/// Number of cells in the POOL pbuf allocator.
pub const PBUF_POOL_SIZE: usize = 100;
/// Payload capacity of one POOL cell.
pub const PBUF_POOL_BUFSIZE: usize = 9100;

// =============================================================================
// Headers / layers
// =============================================================================

pub const PBUF_LINK_HLEN: usize = 14;
pub const PBUF_IP_HLEN: usize = 20;
pub const PBUF_TRANSPORT_HLEN: usize = 20;

// =============================================================================
// TCP
// =============================================================================

/// Receive window advertised to peers.
pub const TCP_WND: u16 = 62720;
/// Maximum segment size (jumbo-frame sized).
pub const TCP_MSS: u16 = 8960;
/// Send buffer, in bytes.
pub const TCP_SND_BUF: u16 = 64512;
/// Maximum number of pbufs queued on one PCB's send queues.
pub const TCP_SND_QUEUELEN: u32 = 2048 * 16;
/// Writable threshold for the send buffer.
pub const TCP_SNDLOWAT: u16 = TCP_SND_BUF / 2;
pub const TCP_MAXRTX: u8 = 12;
pub const TCP_SYNMAXRTX: u8 = 4;
/// Keep out-of-order segments for later reassembly.
pub const TCP_QUEUE_OOSEQ: bool = true;

pub const TCP_TTL: u8 = 255;
pub const UDP_TTL: u8 = 255;
pub const ICMP_TTL: u8 = 255;

/// Period of the combined TCP timer, in milliseconds.
pub const TCP_TMR_INTERVAL: u32 = 100;
pub const TCP_FAST_INTERVAL: u32 = 200;
pub const TCP_SLOW_INTERVAL: u32 = 500;

pub const TCP_FIN_WAIT_TIMEOUT: u32 = 20000;
pub const TCP_SYN_RCVD_TIMEOUT: u32 = 20000;
/// Maximum segment lifetime; TIME-WAIT lasts twice this.
pub const TCP_MSL: u32 = 60000;
/// Out-of-order segments are dropped after this many RTOs of silence.
pub const TCP_OOSEQ_TIMEOUT: u32 = 6;

/// First ephemeral port handed out by `tcp_new_port`/`udp_bind`.
pub const TCP_LOCAL_PORT_RANGE_START: u16 = 4096;
pub const TCP_LOCAL_PORT_RANGE_END: u16 = 0x7fff;

/// Initial sequence number seed.
pub const TCP_ISS_SEED: u32 = 6510;

// =============================================================================
// Session layer
// =============================================================================

/// Session timeout sweep period, in milliseconds.
pub const SESSION_SWEEP_INTERVAL: u32 = netsys_abi::net::TIMEOUT_AGENT_GRANULARITY_MS;

/// How long a `tcp_connect` caller stays parked before the poison pill.
pub const TCP_CONNECT_TIMEOUT_MS: u32 = 1000;

/// Bytes of pattern payload in a generated echo request.
pub const ICMP_ECHO_PAYLOAD: usize = 50;

/// Runtime sizing of a stack instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetConfig {
    pub mem_size: usize,
    pub pbuf_pool_size: usize,
    pub pbuf_pool_bufsize: usize,
    pub memp_num_pbuf: usize,
    pub memp_num_udp_pcb: usize,
    pub memp_num_tcp_pcb: usize,
    pub memp_num_tcp_pcb_listen: usize,
    pub memp_num_tcp_seg: usize,
    pub max_sessions: usize,
    pub max_icmp_sessions: usize,
}

impl NetConfig {
    pub const fn new() -> Self {
        Self {
            mem_size: MEM_SIZE,
            pbuf_pool_size: PBUF_POOL_SIZE,
            pbuf_pool_bufsize: PBUF_POOL_BUFSIZE,
            memp_num_pbuf: MEMP_NUM_PBUF,
            memp_num_udp_pcb: MEMP_NUM_UDP_PCB,
            memp_num_tcp_pcb: MEMP_NUM_TCP_PCB,
            memp_num_tcp_pcb_listen: MEMP_NUM_TCP_PCB_LISTEN,
            memp_num_tcp_seg: MEMP_NUM_TCP_SEG,
            max_sessions: MAX_SESSIONS,
            max_icmp_sessions: MAX_ICMP_SESSIONS,
        }
    }

    /// A configuration with small buffers, for unit tests.
    pub const fn small() -> Self {
        Self {
            mem_size: 256 * 1024,
            pbuf_pool_size: 16,
            pbuf_pool_bufsize: 1600,
            ..Self::new()
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}

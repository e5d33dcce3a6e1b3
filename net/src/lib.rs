//! TCP/IP engine of the network domain.
//!
//! Layers, bottom up:
//!
//! - `mem`, `memp`, `pbuf`: arena, fixed object pools and packet buffers
//! - `inet`, `ip`: checksums and the seam to the IP layer
//! - `tcp`, `tcp_in`, `tcp_out`, `udp`, `icmp`: the protocol engines
//! - `session`: capability requests mapped onto the engines, park/wake
//! - `netsys`: the stack instance the runtime drives

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod icmp;
pub mod inet;
pub mod ip;
pub mod mem;
pub mod memp;
pub mod netsys;
pub mod pbuf;
pub mod session;
pub mod tcp;
mod tcp_in;
mod tcp_out;
pub mod types;
pub mod udp;

#[cfg(test)]
mod test_fixtures;

pub use config::NetConfig;
pub use ip::{IpOutput, Ipv4Header, NetIf};
pub use netsys::{DomainNetSys, NetSys, install, netsys, with_netsys};
pub use pbuf::{BufStore, Pbuf, PbufKind, PbufLayer};
pub use session::{NetSysError, Reply, Request};
pub use tcp::{Tcp, TcpEvents, TcpHandle, TcpState};
pub use types::{IpProtocol, Ipv4Addr, NetError, NetResult, Port, Ssid};
pub use udp::Udp;

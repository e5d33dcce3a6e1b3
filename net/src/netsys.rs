//! The network domain: one stack instance serving one interface.
//!
//! [`NetSys`] owns the buffer store, the protocol engines, the session layer
//! and the park table. The hosting runtime drives it through three entry
//! points:
//!
//! - [`NetSys::ip_input`] for each received IPv4 datagram,
//! - [`NetSys::tick`] with elapsed wall time,
//! - [`NetSys::request`] / [`NetSys::call`] for each capability request.
//!
//! After any of them the runtime drains woken callers with
//! [`NetSys::drain_woken`] and re-delivers their requests.

use alloc::boxed::Box;
use alloc::rc::Rc;

use netsys_abi::net::{NetSysOp, ResultCode};
use netsys_lib::{ParkTable, SpinMutex, SpinMutexGuard, WakeToken, klog_debug, klog_info, klog_trace};
use spin::Once;

use crate::config::{NetConfig, SESSION_SWEEP_INTERVAL, TCP_TMR_INTERVAL};
use crate::icmp::{DestUnreach, Icmp, IcmpInput};
use crate::inet::inet_chksum;
use crate::ip::{IpOutput, Ipv4Header, NetIf};
use crate::pbuf::{BufStore, Pbuf};
use crate::session::{Engine, NetSysError, Reply, Request, Sessions, with_tcp};
use crate::tcp::Tcp;
use crate::types::{IpProtocol, Ipv4Addr, NetResult, Ssid};
use crate::udp::{Udp, UdpInput};

/// Quoted in a destination-unreachable message: the IP header (with
/// options) plus 8 bytes of payload.
const QUOTE_MAX: usize = 60 + 8;

pub struct NetSys<O: IpOutput> {
    cfg: NetConfig,
    netif: NetIf,
    store: Rc<BufStore>,
    tcp: Tcp,
    udp: Udp,
    icmp: Icmp,
    sessions: Sessions,
    park: ParkTable,
    io: O,
    sweep_ms: u32,
    tcp_ms: u32,
}

impl<O: IpOutput> NetSys<O> {
    pub fn new(cfg: NetConfig, netif: NetIf, io: O) -> Self {
        let store = BufStore::new(&cfg);
        klog_info!(
            "netsys: up ip={} mask={} gw={} pool={}x{}",
            netif.ip,
            netif.netmask,
            netif.gw,
            cfg.pbuf_pool_size,
            cfg.pbuf_pool_bufsize
        );
        Self {
            tcp: Tcp::new(&cfg, Rc::clone(&store)),
            udp: Udp::new(&cfg, Rc::clone(&store)),
            icmp: Icmp::new(Rc::clone(&store)),
            sessions: Sessions::new(&cfg),
            park: ParkTable::new(),
            store,
            cfg,
            netif,
            io,
            sweep_ms: 0,
            tcp_ms: 0,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    pub fn netif(&self) -> &NetIf {
        &self.netif
    }

    pub fn store(&self) -> &Rc<BufStore> {
        &self.store
    }

    pub fn tcp(&self) -> &Tcp {
        &self.tcp
    }

    pub fn udp(&self) -> &Udp {
        &self.udp
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub fn park_table(&self) -> &ParkTable {
        &self.park
    }

    pub fn io(&self) -> &O {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut O {
        &mut self.io
    }

    fn split(&mut self) -> (&mut Sessions, Engine<'_>) {
        (
            &mut self.sessions,
            Engine {
                netif: &self.netif,
                io: &mut self.io,
                tcp: &mut self.tcp,
                udp: &mut self.udp,
                icmp: &mut self.icmp,
                park: &mut self.park,
            },
        )
    }

    // ---------------------------------------------------------------------
    // Input
    // ---------------------------------------------------------------------

    fn accepts(&self, dst: Ipv4Addr) -> bool {
        dst == self.netif.ip
            || self.netif.is_broadcast(dst)
            || dst.is_multicast()
            || self.netif.ip.is_any()
    }

    /// Deliver one received datagram. `p` starts at the IPv4 header and is
    /// consumed.
    pub fn ip_input(&mut self, p: Pbuf) {
        let mut raw = [0u8; QUOTE_MAX];
        let copied = p.copy_out(0, &mut raw);
        let Some(iph) = Ipv4Header::parse(&raw[..copied]) else {
            klog_debug!("ip: dropping malformed datagram len={}", p.tot_len());
            p.free();
            return;
        };
        if inet_chksum(&raw[..iph.header_len]) != 0 || iph.total_len > p.tot_len() {
            klog_debug!("ip: dropping bad datagram from {}", iph.src);
            p.free();
            return;
        }
        if !self.accepts(iph.dst) {
            klog_trace!("ip: not for us: {}", iph.dst);
            p.free();
            return;
        }
        p.realloc(iph.total_len);
        let quote = copied.min(iph.header_len + 8).min(iph.total_len);
        let for_us = !self.netif.is_broadcast(iph.dst) && !iph.dst.is_multicast();

        let (sessions, mut eng) = self.split();
        match IpProtocol::from_u8(iph.proto) {
            Some(IpProtocol::Tcp) => {
                with_tcp(&mut sessions.table, &mut eng, |tcp, cx| tcp.input(p, &iph, cx));
            }
            Some(IpProtocol::Udp) => match eng.udp.input(p, &iph) {
                UdpInput::Delivered(Some(ssid)) => {
                    eng.park.wake(ssid.raw());
                }
                UdpInput::NoMatch if for_us => {
                    let _ = eng.icmp.dest_unreach(
                        &raw[..quote],
                        &iph,
                        DestUnreach::Port,
                        eng.netif,
                        &mut *eng.io,
                    );
                }
                _ => {}
            },
            Some(IpProtocol::Icmp) => {
                if let IcmpInput::EchoReply(id) =
                    eng.icmp.input(p, &iph, eng.netif, &mut *eng.io)
                {
                    sessions.icmp_reply(eng.park, id);
                }
            }
            None => {
                p.free();
                if for_us {
                    let _ = eng.icmp.dest_unreach(
                        &raw[..quote],
                        &iph,
                        DestUnreach::Proto,
                        eng.netif,
                        &mut *eng.io,
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Advance time by `elapsed_ms`: the session sweep runs every
    /// `SESSION_SWEEP_INTERVAL` ms, the TCP timer every `TCP_TMR_INTERVAL`.
    /// Returns the number of waits that expired.
    pub fn tick(&mut self, elapsed_ms: u32) -> usize {
        let mut expired = 0;
        self.sweep_ms = self.sweep_ms.saturating_add(elapsed_ms);
        while self.sweep_ms >= SESSION_SWEEP_INTERVAL {
            self.sweep_ms -= SESSION_SWEEP_INTERVAL;
            expired += self.park.tick(SESSION_SWEEP_INTERVAL);
        }
        self.tcp_ms = self.tcp_ms.saturating_add(elapsed_ms);
        while self.tcp_ms >= TCP_TMR_INTERVAL {
            self.tcp_ms -= TCP_TMR_INTERVAL;
            let (sessions, mut eng) = self.split();
            with_tcp(&mut sessions.table, &mut eng, |tcp, cx| tcp.tmr(cx));
        }
        expired
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    pub fn request(&mut self, ssid: u32, req: Request<'_>) -> Result<Reply, NetSysError> {
        let ssid = Ssid::new(ssid).ok_or(NetSysError::NoExistingSession)?;
        let (sessions, mut eng) = self.split();
        sessions.handle(&mut eng, ssid, req)
    }

    /// Decode and run a request in its register form. A parked caller gets
    /// `None` as its code.
    pub fn call(
        &mut self,
        op: u32,
        ssid: u32,
        w1: u32,
        w2: u32,
        data: &[u8],
    ) -> (Option<ResultCode>, Option<Reply>) {
        let Some(op) = NetSysOp::from_raw(op) else {
            klog_debug!("netsys: unknown request op={:#x}", op);
            return (Some(ResultCode::UnknownRequest), None);
        };
        match self.request(ssid, Request::decode(op, w1, w2, data)) {
            Ok(reply) => (reply.code(), Some(reply)),
            Err(e) => (Some(e.code()), None),
        }
    }

    /// Hand every woken caller's token to `f`; returns how many there were.
    pub fn drain_woken(&mut self, f: impl FnMut(WakeToken)) -> usize {
        self.park.drain_woken(f)
    }
}

impl IpOutput for Box<dyn IpOutput> {
    fn ip_output(
        &mut self,
        p: &Pbuf,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        ttl: u8,
        proto: IpProtocol,
    ) -> NetResult {
        (**self).ip_output(p, src, dst, ttl, proto)
    }
}

// =============================================================================
// Domain instance
// =============================================================================

/// The stack installed for this domain.
pub type DomainNetSys = NetSys<Box<dyn IpOutput>>;

struct Installed(SpinMutex<DomainNetSys>);

// SAFETY: the domain runs one server loop; the timer agent and the loop only
// reach the stack through this mutex, and no `Rc` handed out by the stack
// outlives a locked call.
unsafe impl Send for Installed {}
unsafe impl Sync for Installed {}

static NETSYS: Once<Installed> = Once::new();

/// Install the domain's stack. Later calls keep the first instance and
/// return `false`.
pub fn install(cfg: NetConfig, netif: NetIf, io: Box<dyn IpOutput>) -> bool {
    let mut fresh = false;
    NETSYS.call_once(|| {
        fresh = true;
        Installed(SpinMutex::new(NetSys::new(cfg, netif, io)))
    });
    fresh
}

/// Lock the installed stack, if any.
pub fn netsys() -> Option<SpinMutexGuard<'static, DomainNetSys>> {
    NETSYS.get().map(|i| i.0.lock())
}

/// Run `f` against the installed stack.
pub fn with_netsys<R>(f: impl FnOnce(&mut DomainNetSys) -> R) -> Option<R> {
    let mut guard = netsys()?;
    Some(f(&mut guard))
}

#[cfg(test)]
#[path = "netsys_tests.rs"]
mod netsys_tests;

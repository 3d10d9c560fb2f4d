// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! cBPF emission for filters: per-primitive emitters keyed on (kind, protocol, sub-protocol,
//! direction), link-type parameterized offsets, forward-skip arithmetic, composite stitching
//! and negation.
//!
//! Every emitter is pure and is run twice: once to learn its instruction count, then again
//! with the accept/drop slot indices that count determines. The two runs cannot diverge, so
//! an advertised size is always exact, including the conditional IPv6 netmask instructions.

use std::net::{Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

use crate::cbpf::{Instruction, JumpCondition, Size, PROG_MAX_INSNS, RET_DROP, RET_KEEP};
use crate::error::CompileError;
use crate::filter::{Composite, Direction, Filter, Kind, Primitive, Protocol, SubProtocol};
use crate::resolver::{lookup_service, Resolver};
use crate::LinkType;

const ETHER_TYPE_IP4: u32 = 0x0800;
const ETHER_TYPE_IP6: u32 = 0x86dd;
const ETHER_TYPE_ARP: u32 = 0x0806;
const ETHER_TYPE_RARP: u32 = 0x8035;

// Protocol family words of the BSD loopback (DLT_NULL) pseudo-header.
const AF_INET: u32 = 2;
const AF_INET6: u32 = 30;

// Low 13 bits of the IPv4 flags+fragment-offset halfword: non-zero means a later fragment,
// which carries no L4 header.
const FRAGMENT_OFFSET_MASK: u32 = 0x1fff;
// IPv6 next-header value announcing a fragment/continuation header.
const IP6_CONTINUATION: u32 = 0x2c;

const IP_PROTO_TCP: u32 = 0x06;
const IP_PROTO_UDP: u32 = 0x11;
const IP_PROTO_SCTP: u32 = 0x84;

/// Load the EtherType (Ethernet) or the address-family word (Null).
fn load_ether_kind(link: LinkType) -> Instruction {
    match link {
        LinkType::Null => Instruction::LoadAbsolute {
            off: 0,
            size: Size::Word,
        },
        LinkType::Ethernet => Instruction::LoadAbsolute {
            off: 12,
            size: Size::Half,
        },
    }
}

fn ip4_kind_value(link: LinkType) -> u32 {
    match link {
        LinkType::Null => AF_INET,
        LinkType::Ethernet => ETHER_TYPE_IP4,
    }
}

fn ip6_kind_value(link: LinkType) -> u32 {
    match link {
        LinkType::Null => AF_INET6,
        LinkType::Ethernet => ETHER_TYPE_IP6,
    }
}

/// Growing instruction vector with forward-skip helpers. Jump targets are absolute indices
/// into the final stream; `None` falls through to the next instruction.
#[derive(Default)]
struct Asm {
    out: Vec<Instruction>,
}

impl Asm {
    fn pos(&self) -> usize {
        self.out.len()
    }

    /// Skip from the instruction about to be pushed to `target`. Saturates during the sizing
    /// pass, where targets are placeholders.
    fn rel(&self, target: Option<usize>) -> u8 {
        match target {
            None => 0,
            Some(t) => t.saturating_sub(self.pos() + 1) as u8,
        }
    }

    fn push(&mut self, insn: Instruction) {
        self.out.push(insn);
    }

    fn load_abs(&mut self, off: u32, size: Size) {
        self.push(Instruction::LoadAbsolute { off, size });
    }

    fn load_ind(&mut self, off: u32, size: Size) {
        self.push(Instruction::LoadIndirect { off, size });
    }

    fn load_mem_shift(&mut self, off: u32) {
        self.push(Instruction::LoadMemShift { off });
    }

    fn alu_and(&mut self, val: u32) {
        self.push(Instruction::AluAndConstant { val });
    }

    fn jump_if(&mut self, cond: JumpCondition, val: u32, jt: Option<usize>, jf: Option<usize>) {
        let skip_true = self.rel(jt);
        let skip_false = self.rel(jf);
        self.push(Instruction::JumpIf {
            cond,
            val,
            skip_true,
            skip_false,
        });
    }

    fn jeq(&mut self, val: u32, jt: Option<usize>, jf: Option<usize>) {
        self.jump_if(JumpCondition::Equal, val, jt, jf);
    }

    fn ret(&mut self, val: u32) {
        self.push(Instruction::RetConstant { val });
    }
}

/// Which header families an address primitive checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyMode {
    /// Whatever the resolved addresses allow: IPv4 with ARP/RARP, plus IPv6.
    Any,
    /// `ip host`/`ip net`: the IPv4 header only.
    Ip4,
    /// `arp host`: ARP sender/target addresses.
    Arp,
    /// `rarp host`.
    Rarp,
    /// `ip6 host`/`ip6 net`.
    Ip6,
}

/// Planned emission for `host` and `net` primitives, IPv4 and IPv6 alike. Addresses are
/// big-endian words as the accumulator sees them.
struct AddrPlan {
    v4: Vec<u32>,
    /// ALU mask for each IPv4 compare; present only when narrower than /32.
    v4_mask: Option<u32>,
    v6: Vec<[u32; 4]>,
    /// How many 32-bit words of each IPv6 address participate in the compare.
    v6_words: usize,
    /// ALU mask for the final IPv6 word when the prefix ends mid-word.
    v6_final_mask: Option<u32>,
    family: FamilyMode,
    direction: Direction,
    link: LinkType,
}

impl AddrPlan {
    fn paired(&self) -> bool {
        matches!(self.direction, Direction::SrcOrDst | Direction::SrcAndDst)
    }

    fn loc4_len(&self) -> usize {
        1 + usize::from(self.v4_mask.is_some()) + self.v4.len()
    }

    fn block4_len(&self) -> usize {
        if self.paired() {
            2 * self.loc4_len()
        } else {
            self.loc4_len()
        }
    }

    fn loc6_len(&self) -> usize {
        2 * self.v6_words + usize::from(self.v6_final_mask.is_some())
    }

    fn ip_offsets(&self) -> (u32, u32) {
        let l = self.link.header_len();
        (l + 12, l + 16)
    }

    fn arp_offsets(&self) -> (u32, u32) {
        let l = self.link.header_len();
        (l + 14, l + 24)
    }

    fn emit(&self, a: &mut Asm, accept: usize, drop_: usize) {
        match self.family {
            FamilyMode::Ip4 => self.emit_single4(a, ip4_kind_value(self.link), self.ip_offsets(), accept, drop_),
            FamilyMode::Arp => self.emit_single4(a, ETHER_TYPE_ARP, self.arp_offsets(), accept, drop_),
            FamilyMode::Rarp => self.emit_single4(a, ETHER_TYPE_RARP, self.arp_offsets(), accept, drop_),
            FamilyMode::Ip6 => self.emit_single6(a, accept, drop_),
            FamilyMode::Any => {
                if self.v4.is_empty() {
                    self.emit_single6(a, accept, drop_);
                    return;
                }
                a.push(load_ether_kind(self.link));
                let arp_guard = a.pos() + 1 + self.block4_len();
                a.jeq(ip4_kind_value(self.link), None, Some(arp_guard));
                self.blocks4(a, self.ip_offsets(), accept, drop_);
                let ip6_guard = a.pos() + 2 + self.block4_len();
                let rarp_fail = if self.v6.is_empty() { drop_ } else { ip6_guard };
                a.jeq(ETHER_TYPE_ARP, Some(a.pos() + 2), None);
                a.jeq(ETHER_TYPE_RARP, None, Some(rarp_fail));
                self.blocks4(a, self.arp_offsets(), accept, drop_);
                if !self.v6.is_empty() {
                    a.jeq(ip6_kind_value(self.link), None, Some(drop_));
                    self.blocks6(a, accept, drop_);
                }
            }
        }
    }

    fn emit_single4(
        &self,
        a: &mut Asm,
        kind_value: u32,
        offsets: (u32, u32),
        accept: usize,
        drop_: usize,
    ) {
        a.push(load_ether_kind(self.link));
        a.jeq(kind_value, None, Some(drop_));
        self.blocks4(a, offsets, accept, drop_);
    }

    fn emit_single6(&self, a: &mut Asm, accept: usize, drop_: usize) {
        a.push(load_ether_kind(self.link));
        a.jeq(ip6_kind_value(self.link), None, Some(drop_));
        self.blocks6(a, accept, drop_);
    }

    fn blocks4(&self, a: &mut Asm, (src_off, dst_off): (u32, u32), accept: usize, drop_: usize) {
        match self.direction {
            Direction::Src => self.loc4(a, src_off, accept, Some(drop_)),
            Direction::Dst => self.loc4(a, dst_off, accept, Some(drop_)),
            Direction::SrcOrDst => {
                self.loc4(a, src_off, accept, None);
                self.loc4(a, dst_off, accept, Some(drop_));
            }
            Direction::SrcAndDst => {
                let dst_loc = a.pos() + self.loc4_len();
                self.loc4(a, src_off, dst_loc, Some(drop_));
                self.loc4(a, dst_off, accept, Some(drop_));
            }
            _ => unreachable!("direction validated during planning"),
        }
    }

    /// One load-and-compare site: load a word, mask it if needed, then match it against every
    /// candidate address. A hit goes to `match_target`; exhausting the candidates goes to
    /// `fail` (`None` falls into the next site).
    fn loc4(&self, a: &mut Asm, off: u32, match_target: usize, fail: Option<usize>) {
        a.load_abs(off, Size::Word);
        if let Some(mask) = self.v4_mask {
            a.alu_and(mask);
        }
        let last = self.v4.len() - 1;
        for (k, addr) in self.v4.iter().enumerate() {
            let jf = if k == last { fail } else { None };
            a.jeq(*addr, Some(match_target), jf);
        }
    }

    fn blocks6(&self, a: &mut Asm, accept: usize, drop_: usize) {
        let l = self.link.header_len();
        let (src_base, dst_base) = (l + 8, l + 24);
        let loc = self.loc6_len();
        let last = self.v6.len() - 1;
        for (i, addr) in self.v6.iter().enumerate() {
            let per_addr = if self.paired() { 2 * loc } else { loc };
            let next_addr = a.pos() + per_addr;
            let chain = if i == last { drop_ } else { next_addr };
            match self.direction {
                Direction::Src => self.loc6(a, src_base, addr, accept, chain),
                Direction::Dst => self.loc6(a, dst_base, addr, accept, chain),
                Direction::SrcOrDst => {
                    let dst_loc = a.pos() + loc;
                    self.loc6(a, src_base, addr, accept, dst_loc);
                    self.loc6(a, dst_base, addr, accept, chain);
                }
                Direction::SrcAndDst => {
                    let dst_loc = a.pos() + loc;
                    self.loc6(a, src_base, addr, dst_loc, chain);
                    self.loc6(a, dst_base, addr, accept, chain);
                }
                _ => unreachable!("direction validated during planning"),
            }
        }
    }

    /// Word-by-word IPv6 compare. Only the final word may carry a mask; a mask ending on a
    /// word boundary needs no ALU instruction at all.
    fn loc6(&self, a: &mut Asm, base: u32, words: &[u32; 4], match_target: usize, fail: usize) {
        for i in 0..self.v6_words {
            a.load_abs(base + 4 * i as u32, Size::Word);
            let last = i == self.v6_words - 1;
            if last {
                if let Some(mask) = self.v6_final_mask {
                    a.alu_and(mask);
                }
            }
            let jt = if last { Some(match_target) } else { None };
            a.jeq(words[i], jt, Some(fail));
        }
    }
}

/// Which IP versions a port primitive checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortFamilies {
    Both,
    V4,
    V6,
}

/// Planned emission for `port` and `portrange`.
struct PortPlan {
    lo: u32,
    /// Upper bound for `portrange`; equality compare when absent.
    hi: Option<u32>,
    /// Specific L4 restriction; any of TCP/UDP/SCTP when absent.
    sub: Option<u32>,
    families: PortFamilies,
    direction: Direction,
    link: LinkType,
}

impl PortPlan {
    fn proto_len(&self) -> usize {
        if self.sub.is_some() {
            2
        } else {
            4
        }
    }

    fn loc_len(&self) -> usize {
        1 + if self.hi.is_some() { 2 } else { 1 }
    }

    fn ports_len(&self) -> usize {
        match self.direction {
            Direction::Src | Direction::Dst => self.loc_len(),
            _ => 2 * self.loc_len(),
        }
    }

    fn emit(&self, a: &mut Asm, accept: usize, drop_: usize) {
        let l = self.link.header_len();
        a.push(load_ether_kind(self.link));
        match self.families {
            PortFamilies::Both => {
                let v4_guard = a.pos() + 1 + self.proto_len() + self.ports_len();
                a.jeq(ip6_kind_value(self.link), None, Some(v4_guard));
                self.proto_check(a, l + 6, drop_);
                self.ports6(a, accept, drop_);
                a.jeq(ip4_kind_value(self.link), None, Some(drop_));
                self.proto_check(a, l + 9, drop_);
                self.l4_offset(a, drop_);
                self.ports4(a, accept, drop_);
            }
            PortFamilies::V4 => {
                a.jeq(ip4_kind_value(self.link), None, Some(drop_));
                self.proto_check(a, l + 9, drop_);
                self.l4_offset(a, drop_);
                self.ports4(a, accept, drop_);
            }
            PortFamilies::V6 => {
                a.jeq(ip6_kind_value(self.link), None, Some(drop_));
                self.proto_check(a, l + 6, drop_);
                self.ports6(a, accept, drop_);
            }
        }
    }

    /// Match the IP protocol byte at `off` against the L4 restriction, or against any of
    /// SCTP/TCP/UDP when the primitive does not name one.
    fn proto_check(&self, a: &mut Asm, off: u32, drop_: usize) {
        a.load_abs(off, Size::Byte);
        match self.sub {
            Some(proto) => a.jeq(proto, None, Some(drop_)),
            None => {
                let through = a.pos() + 3;
                a.jeq(IP_PROTO_SCTP, Some(through), None);
                a.jeq(IP_PROTO_TCP, Some(through), None);
                a.jeq(IP_PROTO_UDP, None, Some(drop_));
            }
        }
    }

    /// The variable-length IPv4 header: bail out on later fragments, then point the index
    /// register at the L4 header.
    fn l4_offset(&self, a: &mut Asm, drop_: usize) {
        let l = self.link.header_len();
        a.load_abs(l + 6, Size::Half);
        a.jump_if(
            JumpCondition::BitsSet,
            FRAGMENT_OFFSET_MASK,
            Some(drop_),
            None,
        );
        a.load_mem_shift(l);
    }

    fn ports6(&self, a: &mut Asm, accept: usize, drop_: usize) {
        let l = self.link.header_len();
        self.port_blocks(a, |a, src| {
            let off = if src { l + 40 } else { l + 42 };
            a.load_abs(off, Size::Half);
        }, accept, drop_);
    }

    fn ports4(&self, a: &mut Asm, accept: usize, drop_: usize) {
        let l = self.link.header_len();
        self.port_blocks(a, |a, src| {
            let off = if src { l } else { l + 2 };
            a.load_ind(off, Size::Half);
        }, accept, drop_);
    }

    fn port_blocks(
        &self,
        a: &mut Asm,
        load: impl Fn(&mut Asm, bool),
        accept: usize,
        drop_: usize,
    ) {
        match self.direction {
            Direction::Src => {
                load(a, true);
                self.compare(a, accept, drop_);
            }
            Direction::Dst => {
                load(a, false);
                self.compare(a, accept, drop_);
            }
            Direction::SrcOrDst => {
                let dst_loc = a.pos() + self.loc_len();
                load(a, true);
                self.compare(a, accept, dst_loc);
                load(a, false);
                self.compare(a, accept, drop_);
            }
            Direction::SrcAndDst => {
                let dst_loc = a.pos() + self.loc_len();
                load(a, true);
                self.compare(a, dst_loc, drop_);
                load(a, false);
                self.compare(a, accept, drop_);
            }
            _ => unreachable!("direction validated during planning"),
        }
    }

    /// Compare the loaded port: equality for `port`, an inclusive bound pair for `portrange`.
    fn compare(&self, a: &mut Asm, match_target: usize, fail: usize) {
        match self.hi {
            None => a.jeq(self.lo, Some(match_target), Some(fail)),
            Some(hi) => {
                a.jump_if(JumpCondition::GreaterOrEqual, self.lo, None, Some(fail));
                a.jump_if(
                    JumpCondition::GreaterThan,
                    hi,
                    Some(fail),
                    Some(match_target),
                );
            }
        }
    }
}

/// Planned emission for MAC address primitives. The six bytes are compared as a trailing
/// word and a leading halfword; the word goes first so a `src or dst` miss can skip ahead
/// cheaply.
struct EtherPlan {
    last_four: u32,
    first_two: u32,
    direction: Direction,
}

impl EtherPlan {
    fn emit(&self, a: &mut Asm, accept: usize, drop_: usize) {
        const SRC: (u32, u32) = (8, 6);
        const DST: (u32, u32) = (2, 0);
        match self.direction {
            Direction::Src => self.loc(a, SRC, accept, drop_),
            Direction::Dst => self.loc(a, DST, accept, drop_),
            Direction::SrcOrDst => {
                let dst_loc = a.pos() + 4;
                self.loc(a, SRC, accept, dst_loc);
                self.loc(a, DST, accept, drop_);
            }
            Direction::SrcAndDst => {
                let dst_loc = a.pos() + 4;
                self.loc(a, SRC, dst_loc, drop_);
                self.loc(a, DST, accept, drop_);
            }
            _ => unreachable!("direction validated during planning"),
        }
    }

    fn loc(&self, a: &mut Asm, (last_off, first_off): (u32, u32), match_target: usize, fail: usize) {
        a.load_abs(last_off, Size::Word);
        a.jeq(self.last_four, None, Some(fail));
        a.load_abs(first_off, Size::Half);
        a.jeq(self.first_two, Some(match_target), Some(fail));
    }
}

/// Planned emission for protocol-only primitives: `ether proto X`, `ip proto X`,
/// `ip6 proto X`, bare link families (`ip`, `arp`, ...) and bare L4 names (`tcp`, `udp`, ...).
enum ProtoPlan {
    /// EtherType (or Null AF word) equality.
    EtherKind { value: u32, link: LinkType },
    /// IPv4 carrier with a protocol byte check.
    Ip4 { value: u32, link: LinkType },
    /// IPv6 carrier, including the continuation-header second chance.
    Ip6 { value: u32, link: LinkType },
    /// Both carriers, for a bare L4 name.
    Dual { value: u32, link: LinkType },
}

impl ProtoPlan {
    fn emit(&self, a: &mut Asm, accept: usize, drop_: usize) {
        match *self {
            ProtoPlan::EtherKind { value, link } => {
                a.push(load_ether_kind(link));
                a.jeq(value, None, Some(drop_));
            }
            ProtoPlan::Ip4 { value, link } => {
                a.push(load_ether_kind(link));
                a.jeq(ip4_kind_value(link), None, Some(drop_));
                a.load_abs(link.header_len() + 9, Size::Byte);
                a.jeq(value, None, Some(drop_));
            }
            ProtoPlan::Ip6 { value, link } => {
                a.push(load_ether_kind(link));
                a.jeq(ip6_kind_value(link), None, Some(drop_));
                ip6_proto_compare(a, link, value, accept, drop_);
            }
            ProtoPlan::Dual { value, link } => {
                a.push(load_ether_kind(link));
                let v4_guard = a.pos() + 1 + 5;
                a.jeq(ip6_kind_value(link), None, Some(v4_guard));
                ip6_proto_compare(a, link, value, accept, drop_);
                a.jeq(ip4_kind_value(link), None, Some(drop_));
                a.load_abs(link.header_len() + 9, Size::Byte);
                a.jeq(value, None, Some(drop_));
            }
        }
    }
}

/// The five-instruction IPv6 next-header match: accept the protocol directly, or look past a
/// fragment/continuation header for the real L4 type.
fn ip6_proto_compare(a: &mut Asm, link: LinkType, value: u32, accept: usize, drop_: usize) {
    let l = link.header_len();
    a.load_abs(l + 6, Size::Byte);
    a.jeq(value, Some(accept), None);
    a.jeq(IP6_CONTINUATION, None, Some(drop_));
    a.load_abs(l + 40, Size::Byte);
    a.jeq(value, Some(accept), Some(drop_));
}

/// A primitive's resolved, validated emission plan.
enum Plan {
    Addr(AddrPlan),
    Port(PortPlan),
    Ether(EtherPlan),
    Proto(ProtoPlan),
}

impl Plan {
    fn emit(&self, a: &mut Asm, accept: usize, drop_: usize) {
        match self {
            Plan::Addr(p) => p.emit(a, accept, drop_),
            Plan::Port(p) => p.emit(a, accept, drop_),
            Plan::Ether(p) => p.emit(a, accept, drop_),
            Plan::Proto(p) => p.emit(a, accept, drop_),
        }
    }
}

fn addressable_direction(direction: Direction) -> Result<(), CompileError> {
    match direction {
        Direction::Src | Direction::Dst | Direction::SrcOrDst | Direction::SrcAndDst => Ok(()),
        _ => Err(CompileError::Parse),
    }
}

fn v6_words(addr: Ipv6Addr) -> [u32; 4] {
    let octets = addr.octets();
    [
        BigEndian::read_u32(&octets[0..4]),
        BigEndian::read_u32(&octets[4..8]),
        BigEndian::read_u32(&octets[8..12]),
        BigEndian::read_u32(&octets[12..16]),
    ]
}

fn parse_mac(id: &str) -> Option<(u32, u32)> {
    let parts: Vec<&str> = if id.contains(':') {
        id.split(':').collect()
    } else {
        id.split('-').collect()
    };
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    let last_four = BigEndian::read_u32(&bytes[2..6]);
    let first_two = u32::from(BigEndian::read_u16(&bytes[0..2]));
    Some((last_four, first_two))
}

fn family_mode(protocol: Protocol) -> Result<FamilyMode, CompileError> {
    match protocol {
        Protocol::Unset => Ok(FamilyMode::Any),
        Protocol::Ip => Ok(FamilyMode::Ip4),
        Protocol::Arp => Ok(FamilyMode::Arp),
        Protocol::Rarp => Ok(FamilyMode::Rarp),
        Protocol::Ip6 => Ok(FamilyMode::Ip6),
        _ => Err(CompileError::Parse),
    }
}

fn plan_host(
    p: &Primitive,
    link: LinkType,
    resolver: &dyn Resolver,
) -> Result<Plan, CompileError> {
    if p.id.is_empty() {
        return Err(CompileError::BlankHost);
    }
    addressable_direction(p.direction)?;
    if p.protocol == Protocol::Ether {
        let (last_four, first_two) = parse_mac(&p.id)
            .ok_or_else(|| CompileError::InvalidEthernetAddress(p.id.clone()))?;
        return Ok(Plan::Ether(EtherPlan {
            last_four,
            first_two,
            direction: p.direction,
        }));
    }
    if p.id.contains('/') {
        return Err(CompileError::HostWithCidr(p.id.clone()));
    }
    let family = family_mode(p.protocol)?;
    let (v4, v6) = if let Ok(addr) = p.id.parse::<Ipv4Addr>() {
        (vec![u32::from(addr)], Vec::new())
    } else if let Ok(addr) = p.id.parse::<Ipv6Addr>() {
        (Vec::new(), vec![v6_words(addr)])
    } else {
        log::debug!("resolving host {:?}", p.id);
        let resolved = resolver.resolve(&p.id).map_err(|e| match e {
            crate::error::ResolveError::NotFound(_) => CompileError::UnknownHost(p.id.clone()),
            other => CompileError::Resolver(other),
        })?;
        (
            resolved.v4.iter().map(|a| u32::from(*a)).collect(),
            resolved.v6.iter().map(|a| v6_words(*a)).collect(),
        )
    };
    let needs_v4 = matches!(family, FamilyMode::Ip4 | FamilyMode::Arp | FamilyMode::Rarp);
    if (needs_v4 && v4.is_empty()) || (family == FamilyMode::Ip6 && v6.is_empty()) {
        return Err(CompileError::UnknownHost(p.id.clone()));
    }
    if v4.is_empty() && v6.is_empty() {
        return Err(CompileError::UnknownHost(p.id.clone()));
    }
    Ok(Plan::Addr(AddrPlan {
        v4,
        v4_mask: None,
        v6,
        v6_words: 4,
        v6_final_mask: None,
        family,
        direction: p.direction,
        link,
    }))
}

fn plan_net(p: &Primitive, link: LinkType) -> Result<Plan, CompileError> {
    if p.id.is_empty() {
        return Err(CompileError::BlankQualifier("net"));
    }
    addressable_direction(p.direction)?;
    let family = family_mode(p.protocol)?;

    let (address, prefix) = match p.id.split_once('/') {
        None => (p.id.as_str(), None),
        Some((address, bits)) => {
            let bits: u32 = bits
                .parse()
                .map_err(|_| CompileError::InvalidNet(p.id.clone()))?;
            (address, Some(bits))
        }
    };

    if let Ok(addr) = address.parse::<Ipv4Addr>() {
        let addr = u32::from(addr);
        let bits = prefix.unwrap_or(32);
        if bits > 32 {
            return Err(CompileError::InvalidNet(p.id.clone()));
        }
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        if addr & !mask != 0 {
            return Err(CompileError::NetBitsPastMask(p.id.clone()));
        }
        if family == FamilyMode::Ip6 {
            return Err(CompileError::InvalidNet(p.id.clone()));
        }
        return Ok(Plan::Addr(AddrPlan {
            v4: vec![addr],
            v4_mask: (mask != u32::MAX).then_some(mask),
            v6: Vec::new(),
            v6_words: 0,
            v6_final_mask: None,
            family,
            direction: p.direction,
            link,
        }));
    }

    if let Ok(addr) = address.parse::<Ipv6Addr>() {
        let words = v6_words(addr);
        let bits = prefix.unwrap_or(128) as usize;
        if bits == 0 || bits > 128 {
            return Err(CompileError::InvalidNet(p.id.clone()));
        }
        // Address bits past the prefix must be clear.
        for (i, word) in words.iter().enumerate() {
            let covered = bits.saturating_sub(i * 32).min(32);
            let mask = if covered == 0 {
                0
            } else {
                u32::MAX << (32 - covered)
            };
            if word & !mask != 0 {
                return Err(CompileError::NetBitsPastMask(p.id.clone()));
            }
        }
        if !matches!(family, FamilyMode::Any | FamilyMode::Ip6) {
            return Err(CompileError::InvalidNet(p.id.clone()));
        }
        let word_count = bits.div_ceil(32);
        let partial = bits % 32;
        let final_mask = (partial != 0).then(|| u32::MAX << (32 - partial));
        return Ok(Plan::Addr(AddrPlan {
            v4: Vec::new(),
            v4_mask: None,
            v6: vec![words],
            v6_words: word_count,
            v6_final_mask: final_mask,
            family: FamilyMode::Ip6,
            direction: p.direction,
            link,
        }));
    }

    Err(CompileError::InvalidNet(p.id.clone()))
}

fn plan_port(p: &Primitive, link: LinkType) -> Result<Plan, CompileError> {
    if p.id.is_empty() {
        return Err(CompileError::BlankQualifier(match p.kind {
            Kind::PortRange => "portrange",
            _ => "port",
        }));
    }
    addressable_direction(p.direction)?;
    let families = match p.protocol {
        Protocol::Unset => PortFamilies::Both,
        Protocol::Ip => PortFamilies::V4,
        Protocol::Ip6 => PortFamilies::V6,
        _ => return Err(CompileError::Parse),
    };
    let sub = match p.sub_protocol {
        SubProtocol::Unset => None,
        SubProtocol::Tcp => Some(IP_PROTO_TCP),
        SubProtocol::Udp => Some(IP_PROTO_UDP),
        SubProtocol::Sctp => Some(IP_PROTO_SCTP),
        _ => return Err(CompileError::Parse),
    };
    let (lo, hi) = match p.kind {
        Kind::Port => {
            let port = parse_port(&p.id).ok_or_else(|| CompileError::InvalidPort(p.id.clone()))?;
            (port, None)
        }
        Kind::PortRange => {
            let (lo, hi) = p
                .id
                .split_once('-')
                .and_then(|(lo, hi)| Some((parse_port(lo)?, parse_port(hi)?)))
                .filter(|(lo, hi)| lo <= hi)
                .ok_or_else(|| CompileError::InvalidPort(p.id.clone()))?;
            (lo, Some(hi))
        }
        _ => unreachable!(),
    };
    Ok(Plan::Port(PortPlan {
        lo,
        hi,
        sub,
        families,
        direction: p.direction,
        link,
    }))
}

fn parse_port(id: &str) -> Option<u32> {
    if let Ok(port) = id.parse::<u16>() {
        return Some(u32::from(port));
    }
    lookup_service(id).map(u32::from)
}

fn plan_proto(p: &Primitive, link: LinkType) -> Result<Plan, CompileError> {
    let sub_name = || format!("{:?}", p.sub_protocol).to_lowercase();
    if p.sub_protocol == SubProtocol::Unknown {
        return Err(CompileError::UnknownProtocol(p.id.clone()));
    }
    if p.sub_protocol != SubProtocol::Unset {
        let plan = match p.protocol {
            Protocol::Ether => {
                let value = match p.sub_protocol {
                    SubProtocol::Ip => ip4_kind_value(link),
                    SubProtocol::Ip6 => ip6_kind_value(link),
                    other => other
                        .ether_type()
                        .ok_or_else(|| CompileError::UnknownProtocol(sub_name()))?,
                };
                ProtoPlan::EtherKind { value, link }
            }
            Protocol::Ip => ProtoPlan::Ip4 {
                value: p
                    .sub_protocol
                    .ip_proto()
                    .ok_or_else(|| CompileError::UnknownProtocol(sub_name()))?,
                link,
            },
            Protocol::Ip6 => ProtoPlan::Ip6 {
                value: p
                    .sub_protocol
                    .ip_proto()
                    .ok_or_else(|| CompileError::UnknownProtocol(sub_name()))?,
                link,
            },
            Protocol::Unset => {
                if let Some(value) = p.sub_protocol.ip_proto() {
                    ProtoPlan::Dual { value, link }
                } else if let Some(value) = p.sub_protocol.ether_type() {
                    ProtoPlan::EtherKind { value, link }
                } else {
                    return Err(CompileError::UnknownProtocol(sub_name()));
                }
            }
            _ => return Err(CompileError::Parse),
        };
        return Ok(Plan::Proto(plan));
    }
    // No sub-protocol: only a bare link family is emittable.
    if !p.id.is_empty() {
        return Err(CompileError::Parse);
    }
    let value = match p.protocol {
        Protocol::Ip => ip4_kind_value(link),
        Protocol::Ip6 => ip6_kind_value(link),
        Protocol::Arp => ETHER_TYPE_ARP,
        Protocol::Rarp => ETHER_TYPE_RARP,
        _ => return Err(CompileError::Parse),
    };
    Ok(Plan::Proto(ProtoPlan::EtherKind { value, link }))
}

fn plan(p: &Primitive, link: LinkType, resolver: &dyn Resolver) -> Result<Plan, CompileError> {
    match p.kind {
        Kind::Host => plan_host(p, link, resolver),
        Kind::Net => plan_net(p, link),
        Kind::Port | Kind::PortRange => plan_port(p, link),
        Kind::Unset => plan_proto(p, link),
    }
}

fn compile_primitive(
    p: &Primitive,
    link: LinkType,
    resolver: &dyn Resolver,
) -> Result<Vec<Instruction>, CompileError> {
    let plan = plan(p, link, resolver)?;
    let mut probe = Asm::default();
    plan.emit(&mut probe, 0, 0);
    let size = probe.out.len() + 2;
    if size > PROG_MAX_INSNS {
        return Err(CompileError::ProgramTooLong(size));
    }
    let mut a = Asm::default();
    plan.emit(&mut a, size - 2, size - 1);
    let (first, second) = if p.negator {
        (RET_DROP, RET_KEEP)
    } else {
        (RET_KEEP, RET_DROP)
    };
    a.ret(first);
    a.ret(second);
    debug_assert_eq!(a.out.len(), size);
    Ok(a.out)
}

fn primitive_size(
    p: &Primitive,
    link: LinkType,
    resolver: &dyn Resolver,
) -> Result<usize, CompileError> {
    let plan = plan(p, link, resolver)?;
    let mut probe = Asm::default();
    plan.emit(&mut probe, 0, 0);
    Ok(probe.out.len() + 2)
}

fn compile_composite(
    c: &Composite,
    link: LinkType,
    resolver: &dyn Resolver,
) -> Result<Vec<Instruction>, CompileError> {
    if c.filters.len() == 1 {
        return c.filters[0].compile(link, resolver);
    }
    let mut children = Vec::with_capacity(c.filters.len());
    for filter in &c.filters {
        children.push((filter.compile(link, resolver)?, filter.is_negated()));
    }
    let total: usize = children.iter().map(|(insns, _)| insns.len()).sum();
    if total > PROG_MAX_INSNS {
        return Err(CompileError::ProgramTooLong(total));
    }
    // The last child keeps its return pair, which terminates the whole composite; when that
    // child is negated the two slots trade roles for everyone.
    let (accept, drop_) = if children.last().map(|(_, n)| *n).unwrap_or(false) {
        (total - 1, total - 2)
    } else {
        (total - 2, total - 1)
    };
    let jump_to = |from: usize, target: usize| Instruction::Jump {
        skip: (target - from - 1) as u8,
    };
    let mut out: Vec<Instruction> = Vec::with_capacity(total);
    let last = children.len() - 1;
    for (i, (insns, negated)) in children.into_iter().enumerate() {
        if i == last {
            out.extend(insns);
            continue;
        }
        out.extend_from_slice(&insns[..insns.len() - 2]);
        // The two interposed jumps sit exactly where the child's return pair was: the first
        // catches its raw match, the second its raw miss. Negation swaps which of those
        // means success.
        let p1 = out.len();
        match (c.and, negated) {
            (true, false) => {
                out.push(Instruction::Jump { skip: 1 });
                out.push(jump_to(p1 + 1, drop_));
            }
            (true, true) => {
                out.push(jump_to(p1, drop_));
                out.push(Instruction::Jump { skip: 0 });
            }
            (false, false) => {
                out.push(jump_to(p1, accept));
                out.push(Instruction::Jump { skip: 0 });
            }
            (false, true) => {
                out.push(Instruction::Jump { skip: 1 });
                out.push(jump_to(p1 + 1, accept));
            }
        }
    }
    debug_assert_eq!(out.len(), total);
    Ok(out)
}

impl Filter {
    /// Emit the filter as a cBPF instruction stream ending in the accept/drop return pair.
    pub fn compile(
        &self,
        link: LinkType,
        resolver: &dyn Resolver,
    ) -> Result<Vec<Instruction>, CompileError> {
        match self {
            Filter::Primitive(p) => compile_primitive(p, link, resolver),
            Filter::Composite(c) => compile_composite(c, link, resolver),
        }
    }

    /// The exact instruction count [`Filter::compile`] will produce, computed without
    /// emitting the final stream. Hostname primitives consult the resolver, since the count
    /// depends on the addresses returned.
    pub fn size(
        &self,
        link: LinkType,
        resolver: &dyn Resolver,
    ) -> Result<usize, CompileError> {
        match self {
            Filter::Primitive(p) => primitive_size(p, link, resolver),
            Filter::Composite(c) => {
                let mut total = 0;
                for filter in &c.filters {
                    total += filter.size(link, resolver)?;
                }
                Ok(total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some((0xccddeeff, 0xaabb))
        );
        assert_eq!(
            parse_mac("aa-bb-cc-dd-ee-ff"),
            Some((0xccddeeff, 0xaabb))
        );
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:zz"), None);
        assert_eq!(parse_mac("abc"), None);
    }

    #[test]
    fn test_v6_words() {
        let addr: Ipv6Addr = "2a00:1450:4001:824::2004".parse().unwrap();
        assert_eq!(v6_words(addr), [0x2a001450, 0x40010824, 0x0, 0x2004]);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("22"), Some(22));
        assert_eq!(parse_port("ssh"), Some(22));
        assert_eq!(parse_port("70000"), None);
        assert_eq!(parse_port("foo"), None);
    }
}

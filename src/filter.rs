// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! The compiled filter model: qualifier enums and their word tables, the [`Primitive`] atom,
//! and the [`Composite`] conjunction/disjunction, together forming the [`Filter`] tagged union.
//!
//! Structural operations live here (defaulting, adjacent-primitive merging, `gateway`
//! expansion); bytecode emission lives in the `codegen` module.

/// What a primitive matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    /// Not yet determined.
    #[default]
    Unset,
    /// A host address or name.
    Host,
    /// A network, optionally with a CIDR mask.
    Net,
    /// An L4 port.
    Port,
    /// An inclusive L4 port range, written `lo-hi`.
    PortRange,
}

impl Kind {
    pub(crate) fn from_word(word: &str) -> Option<Kind> {
        match word {
            "host" => Some(Kind::Host),
            "net" => Some(Kind::Net),
            "port" => Some(Kind::Port),
            "portrange" => Some(Kind::PortRange),
            _ => None,
        }
    }
}

/// Which side of the conversation a primitive constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Not yet determined.
    #[default]
    Unset,
    /// Both source and destination must match.
    SrcAndDst,
    /// Either source or destination may match.
    SrcOrDst,
    /// Source only.
    Src,
    /// Destination only.
    Dst,
    /// 802.11 receiver address.
    Ra,
    /// 802.11 transmitter address.
    Ta,
    /// 802.11 address 1.
    Addr1,
    /// 802.11 address 2.
    Addr2,
    /// 802.11 address 3.
    Addr3,
    /// 802.11 address 4.
    Addr4,
}

impl Direction {
    pub(crate) fn from_word(word: &str) -> Option<Direction> {
        match word {
            "src" => Some(Direction::Src),
            "dst" => Some(Direction::Dst),
            "src and dst" => Some(Direction::SrcAndDst),
            "src or dst" => Some(Direction::SrcOrDst),
            "ra" => Some(Direction::Ra),
            "ta" => Some(Direction::Ta),
            "addr1" => Some(Direction::Addr1),
            "addr2" => Some(Direction::Addr2),
            "addr3" => Some(Direction::Addr3),
            "addr4" => Some(Direction::Addr4),
            _ => None,
        }
    }
}

/// Link- or network-layer family qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Not yet determined.
    #[default]
    Unset,
    /// Ethernet link layer.
    Ether,
    /// FDDI link layer.
    Fddi,
    /// Token Ring link layer.
    Tr,
    /// 802.11 link layer.
    Wlan,
    /// IPv4.
    Ip,
    /// IPv6.
    Ip6,
    /// ARP.
    Arp,
    /// Reverse ARP.
    Rarp,
    /// DECnet.
    Decnet,
}

impl Protocol {
    pub(crate) fn from_word(word: &str) -> Option<Protocol> {
        match word {
            "ether" => Some(Protocol::Ether),
            "fddi" => Some(Protocol::Fddi),
            "tr" => Some(Protocol::Tr),
            "wlan" => Some(Protocol::Wlan),
            "ip" => Some(Protocol::Ip),
            "ip6" => Some(Protocol::Ip6),
            "arp" => Some(Protocol::Arp),
            "rarp" => Some(Protocol::Rarp),
            "decnet" => Some(Protocol::Decnet),
            _ => None,
        }
    }
}

/// L4 protocol, or a refined L2/L3 protocol named after `proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubProtocol {
    /// Not yet determined.
    #[default]
    Unset,
    /// IPv4, as in `ether proto ip`.
    Ip,
    /// IPv6.
    Ip6,
    /// ARP.
    Arp,
    /// Reverse ARP.
    Rarp,
    /// AppleTalk.
    Atalk,
    /// AppleTalk ARP.
    Aarp,
    /// DECnet phase IV.
    Decnet,
    /// DEC SCA.
    Sca,
    /// DEC LAT.
    Lat,
    /// DEC MOP download.
    Mopdl,
    /// DEC MOP remote console.
    Moprc,
    /// OSI over LLC.
    Iso,
    /// Spanning tree protocol.
    Stp,
    /// Novell IPX.
    Ipx,
    /// NetBEUI.
    Netbeui,
    /// ICMP.
    Icmp,
    /// ICMPv6.
    Icmp6,
    /// IGMP.
    Igmp,
    /// Cisco IGRP.
    Igrp,
    /// PIM.
    Pim,
    /// IPsec authentication header.
    Ah,
    /// IPsec ESP.
    Esp,
    /// VRRP.
    Vrrp,
    /// UDP.
    Udp,
    /// TCP.
    Tcp,
    /// SCTP.
    Sctp,
    /// A name not in the table; the raw word is kept in the primitive id.
    Unknown,
}

impl SubProtocol {
    pub(crate) fn from_word(word: &str) -> Option<SubProtocol> {
        match word {
            "ip" => Some(SubProtocol::Ip),
            "ip6" => Some(SubProtocol::Ip6),
            "arp" => Some(SubProtocol::Arp),
            "rarp" => Some(SubProtocol::Rarp),
            "atalk" => Some(SubProtocol::Atalk),
            "aarp" => Some(SubProtocol::Aarp),
            "decnet" => Some(SubProtocol::Decnet),
            "sca" => Some(SubProtocol::Sca),
            "lat" => Some(SubProtocol::Lat),
            "mopdl" => Some(SubProtocol::Mopdl),
            "moprc" => Some(SubProtocol::Moprc),
            "iso" => Some(SubProtocol::Iso),
            "stp" => Some(SubProtocol::Stp),
            "ipx" => Some(SubProtocol::Ipx),
            "netbeui" => Some(SubProtocol::Netbeui),
            "icmp" => Some(SubProtocol::Icmp),
            "icmp6" => Some(SubProtocol::Icmp6),
            "igmp" => Some(SubProtocol::Igmp),
            "igrp" => Some(SubProtocol::Igrp),
            "pim" => Some(SubProtocol::Pim),
            "ah" => Some(SubProtocol::Ah),
            "esp" => Some(SubProtocol::Esp),
            "vrrp" => Some(SubProtocol::Vrrp),
            "udp" => Some(SubProtocol::Udp),
            "tcp" => Some(SubProtocol::Tcp),
            "sctp" => Some(SubProtocol::Sctp),
            _ => None,
        }
    }

    /// IP protocol number, for sub-protocols that are L4 payloads of IPv4/IPv6.
    pub(crate) fn ip_proto(self) -> Option<u32> {
        match self {
            SubProtocol::Icmp => Some(1),
            SubProtocol::Igmp => Some(2),
            SubProtocol::Tcp => Some(6),
            SubProtocol::Igrp => Some(9),
            SubProtocol::Udp => Some(17),
            SubProtocol::Esp => Some(50),
            SubProtocol::Ah => Some(51),
            SubProtocol::Icmp6 => Some(58),
            SubProtocol::Pim => Some(103),
            SubProtocol::Vrrp => Some(112),
            SubProtocol::Sctp => Some(132),
            _ => None,
        }
    }

    /// EtherType, for sub-protocols that are link-layer payloads.
    pub(crate) fn ether_type(self) -> Option<u32> {
        match self {
            SubProtocol::Ip => Some(0x0800),
            SubProtocol::Ip6 => Some(0x86dd),
            SubProtocol::Arp => Some(0x0806),
            SubProtocol::Rarp => Some(0x8035),
            SubProtocol::Atalk => Some(0x809b),
            SubProtocol::Aarp => Some(0x80f3),
            SubProtocol::Decnet => Some(0x6003),
            SubProtocol::Sca => Some(0x6007),
            SubProtocol::Lat => Some(0x6004),
            SubProtocol::Mopdl => Some(0x6001),
            SubProtocol::Moprc => Some(0x6002),
            SubProtocol::Ipx => Some(0x8137),
            _ => None,
        }
    }
}

/// The atomic filter: one predicate of the tcpdump grammar.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Primitive {
    /// What is matched on.
    pub kind: Kind,
    /// Which side of the conversation.
    pub direction: Direction,
    /// L2/L3 family constraint.
    pub protocol: Protocol,
    /// L4 (or refined) protocol constraint.
    pub sub_protocol: SubProtocol,
    /// Invert the predicate.
    pub negator: bool,
    /// Address literal, hostname, port number, service name or CIDR.
    pub id: String,
    /// Set by the `gateway` keyword; expanded into a composite when the expression is grouped.
    pub gateway: bool,
}

impl Primitive {
    /// A primitive with nothing set yet.
    pub fn new() -> Primitive {
        Primitive::default()
    }

    /// True if any qualifier word was consumed into this primitive.
    pub(crate) fn has_qualifier(&self) -> bool {
        self.kind != Kind::Unset
            || self.direction != Direction::Unset
            || self.protocol != Protocol::Unset
            || self.sub_protocol != SubProtocol::Unset
    }

    /// Merge two primitives into one when their fields are pairwise compatible: every
    /// qualifier equal or one side unset, ids equal or one side empty, negators equal.
    /// `host abc` + `src abc` merges to `src host abc`; `udp` + `port 53` merges to
    /// `udp port 53`. Returns `None` when the pair must stay separate predicates, including
    /// when the union would drop an L4 constraint onto an address match (`tcp and host X`).
    pub fn combine(&self, other: &Primitive) -> Option<Primitive> {
        if self.negator != other.negator {
            return None;
        }
        let kind = merge_field(self.kind, other.kind, Kind::Unset)?;
        let direction = merge_field(self.direction, other.direction, Direction::Unset)?;
        let protocol = merge_field(self.protocol, other.protocol, Protocol::Unset)?;
        let sub_protocol =
            merge_field(self.sub_protocol, other.sub_protocol, SubProtocol::Unset)?;
        let id = if self.id == other.id {
            self.id.clone()
        } else if self.id.is_empty() {
            other.id.clone()
        } else if other.id.is_empty() {
            self.id.clone()
        } else {
            return None;
        };
        // An address predicate cannot also carry the port emitters' L4 restriction; keep the
        // pair as a composite so both checks survive.
        if matches!(kind, Kind::Host | Kind::Net) && sub_protocol.ip_proto().is_some() {
            return None;
        }
        Some(Primitive {
            kind,
            direction,
            protocol,
            sub_protocol,
            negator: self.negator,
            id,
            gateway: self.gateway || other.gateway,
        })
    }

    /// Apply the defaulting rules, given the previous primitive in the expression (if any).
    ///
    /// A primitive with no qualifier at all either inherits the whole qualifier list of its
    /// predecessor (`tcp dst port ftp or ftp-data` reads as `... or tcp dst port ftp-data`)
    /// or, with no predecessor, is left untouched for the code generator to reject. Otherwise:
    /// a direction with an addressable protocol implies `host`; a missing direction defaults
    /// to `src or dst`; a bare identifier with no protocol constraint at all defaults to
    /// `host`.
    pub fn set_defaults(&mut self, previous: Option<&Primitive>) {
        if !self.has_qualifier() {
            match previous {
                None => return,
                Some(prev) => {
                    self.kind = prev.kind;
                    self.direction = prev.direction;
                    self.protocol = prev.protocol;
                    self.sub_protocol = prev.sub_protocol;
                }
            }
        }
        if self.kind == Kind::Unset
            && self.direction != Direction::Unset
            && matches!(
                self.protocol,
                Protocol::Ether | Protocol::Ip | Protocol::Ip6 | Protocol::Arp | Protocol::Rarp
            )
        {
            self.kind = Kind::Host;
        }
        if self.direction == Direction::Unset {
            self.direction = Direction::SrcOrDst;
        }
        if self.kind == Kind::Unset
            && self.protocol == Protocol::Unset
            && self.sub_protocol == SubProtocol::Unset
        {
            self.kind = Kind::Host;
        }
    }

    /// Expand a `gateway X` primitive into the composite it stands for: the frame must carry
    /// the gateway's link-layer address and name X at the network layer.
    pub(crate) fn expand_gateway(&self) -> Filter {
        let ether = Primitive {
            kind: Kind::Host,
            direction: Direction::SrcOrDst,
            protocol: Protocol::Ether,
            sub_protocol: SubProtocol::Unset,
            negator: self.negator,
            id: self.id.clone(),
            gateway: false,
        };
        let host = Primitive {
            kind: Kind::Host,
            direction: Direction::SrcOrDst,
            protocol: Protocol::Unset,
            sub_protocol: SubProtocol::Unset,
            negator: false,
            id: self.id.clone(),
            gateway: false,
        };
        Filter::Composite(Composite {
            and: true,
            filters: vec![Filter::Primitive(ether), Filter::Primitive(host)],
        })
    }
}

fn merge_field<T: Copy + PartialEq>(a: T, b: T, unset: T) -> Option<T> {
    if a == b {
        Some(a)
    } else if a == unset {
        Some(b)
    } else if b == unset {
        Some(a)
    } else {
        None
    }
}

/// A flat list of filters joined by a single operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composite {
    /// True for AND, false for OR.
    pub and: bool,
    /// The children, primitives or nested composites.
    pub filters: Vec<Filter>,
}

/// A compiled filter expression: either a single predicate or a combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// A single predicate.
    Primitive(Primitive),
    /// An AND/OR combination.
    Composite(Composite),
}

impl Filter {
    /// True when the filter is a lone primitive.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Filter::Primitive(_))
    }

    /// Whether the filter's compiled form has its return slots role-swapped by negation.
    /// Composites are never negated themselves; negation lives on primitives.
    pub(crate) fn is_negated(&self) -> bool {
        match self {
            Filter::Primitive(p) => p.negator,
            Filter::Composite(_) => false,
        }
    }
}

/// Fold a flat child list by merging adjacent compatible primitives. Only meaningful under
/// AND: `udp and port 53` collapses into the single primitive `udp port 53`, while an OR of
/// the same pair keeps both alternatives.
pub(crate) fn combine_adjacent(filters: Vec<Filter>) -> Vec<Filter> {
    let mut out: Vec<Filter> = Vec::with_capacity(filters.len());
    for filter in filters {
        if let (Some(Filter::Primitive(last)), Filter::Primitive(next)) =
            (out.last(), &filter)
        {
            if let Some(merged) = last.combine(next) {
                *out.last_mut().unwrap() = Filter::Primitive(merged);
                continue;
            }
        }
        out.push(filter);
    }
    out
}

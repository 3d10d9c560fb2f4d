// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! Shared helpers for the integration tests: a static stand-in for the DNS resolver,
//! shorthand instruction constructors for the expected-stream tables, synthetic frames for
//! end-to-end runs, and a structural validity check for emitted programs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};
use pcapfilter::cbpf::{Instruction, JumpCondition, Size};
use pcapfilter::{ResolveError, ResolvedHost, Resolver};

/// Resolver serving a fixed record set, standing in for the reference's loopback DNS server.
pub struct StaticResolver {
    records: HashMap<String, ResolvedHost>,
}

impl StaticResolver {
    /// A resolver preloaded with the records the shared test cases expect.
    pub fn new() -> StaticResolver {
        let mut resolver = StaticResolver {
            records: HashMap::new(),
        };
        resolver.insert(
            "www.google.com",
            &["216.58.207.36"],
            &["2a00:1450:4001:824::2004"],
        );
        resolver
    }

    pub fn insert(&mut self, name: &str, v4: &[&str], v6: &[&str]) {
        self.records.insert(
            name.to_string(),
            ResolvedHost {
                v4: v4.iter().map(|a| a.parse().unwrap()).collect(),
                v6: v6.iter().map(|a| a.parse().unwrap()).collect(),
            },
        );
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str) -> Result<ResolvedHost, ResolveError> {
        self.records
            .get(host)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(host.to_string()))
    }
}

// Shorthand constructors keeping the expected-instruction tables readable.

pub fn ld(off: u32) -> Instruction {
    Instruction::LoadAbsolute {
        off,
        size: Size::Word,
    }
}

pub fn ldh(off: u32) -> Instruction {
    Instruction::LoadAbsolute {
        off,
        size: Size::Half,
    }
}

pub fn ldb(off: u32) -> Instruction {
    Instruction::LoadAbsolute {
        off,
        size: Size::Byte,
    }
}

pub fn ldx(off: u32) -> Instruction {
    Instruction::LoadMemShift { off }
}

pub fn ldh_x(off: u32) -> Instruction {
    Instruction::LoadIndirect {
        off,
        size: Size::Half,
    }
}

pub fn jeq(val: u32, jt: u8, jf: u8) -> Instruction {
    Instruction::JumpIf {
        cond: JumpCondition::Equal,
        val,
        skip_true: jt,
        skip_false: jf,
    }
}

pub fn jset(val: u32, jt: u8, jf: u8) -> Instruction {
    Instruction::JumpIf {
        cond: JumpCondition::BitsSet,
        val,
        skip_true: jt,
        skip_false: jf,
    }
}

pub fn jgt(val: u32, jt: u8, jf: u8) -> Instruction {
    Instruction::JumpIf {
        cond: JumpCondition::GreaterThan,
        val,
        skip_true: jt,
        skip_false: jf,
    }
}

pub fn jge(val: u32, jt: u8, jf: u8) -> Instruction {
    Instruction::JumpIf {
        cond: JumpCondition::GreaterOrEqual,
        val,
        skip_true: jt,
        skip_false: jf,
    }
}

pub fn and_k(val: u32) -> Instruction {
    Instruction::AluAndConstant { val }
}

pub fn ja(skip: u8) -> Instruction {
    Instruction::Jump { skip }
}

pub fn ret_keep() -> Instruction {
    Instruction::RetConstant { val: 0x40000 }
}

pub fn ret_drop() -> Instruction {
    Instruction::RetConstant { val: 0 }
}

/// Structural validity: bounded length, every jump lands inside the program, and the stream
/// terminates in return instructions.
pub fn check_program(prog: &[Instruction]) {
    assert!(!prog.is_empty());
    assert!(prog.len() <= 255, "{} instructions", prog.len());
    for (i, insn) in prog.iter().enumerate() {
        match *insn {
            Instruction::JumpIf {
                skip_true,
                skip_false,
                ..
            } => {
                assert!(i + 1 + (skip_true as usize) < prog.len());
                assert!(i + 1 + (skip_false as usize) < prog.len());
            }
            Instruction::Jump { skip } => {
                assert!(i + 1 + (skip as usize) < prog.len());
            }
            _ => {}
        }
    }
    assert!(matches!(
        prog.last().unwrap(),
        Instruction::RetConstant { .. }
    ));
}

// Synthetic frames.

fn ethernet_header(ether_type: u16) -> Vec<u8> {
    ethernet_header_with_macs(
        [0x02, 0, 0, 0, 0, 0x01],
        [0x02, 0, 0, 0, 0, 0x02],
        ether_type,
    )
}

pub fn ethernet_header_with_macs(dst: [u8; 6], src: [u8; 6], ether_type: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame
}

fn ipv4_body(
    proto: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    ihl: u8,
    frag: u16,
) -> Vec<u8> {
    let header_len = usize::from(ihl) * 4;
    let mut body = vec![0u8; header_len];
    body[0] = 0x40 | ihl;
    BigEndian::write_u16(&mut body[6..8], frag);
    body[8] = 64; // TTL
    body[9] = proto;
    body[12..16].copy_from_slice(&src.octets());
    body[16..20].copy_from_slice(&dst.octets());
    body.extend_from_slice(&sport.to_be_bytes());
    body.extend_from_slice(&dport.to_be_bytes());
    body.extend_from_slice(&[0u8; 16]);
    body
}

/// An Ethernet IPv4 frame with the given protocol, addresses and L4 ports.
pub fn ipv4_frame(proto: u8, src: &str, dst: &str, sport: u16, dport: u16) -> Vec<u8> {
    ipv4_frame_opts(proto, src, dst, sport, dport, 5, 0)
}

/// Same, with a chosen header length (in 32-bit words) and fragment field.
pub fn ipv4_frame_opts(
    proto: u8,
    src: &str,
    dst: &str,
    sport: u16,
    dport: u16,
    ihl: u8,
    frag: u16,
) -> Vec<u8> {
    let mut frame = ethernet_header(0x0800);
    frame.extend(ipv4_body(
        proto,
        src.parse().unwrap(),
        dst.parse().unwrap(),
        sport,
        dport,
        ihl,
        frag,
    ));
    frame
}

/// An Ethernet IPv6 frame.
pub fn ipv6_frame(next: u8, src: &str, dst: &str, sport: u16, dport: u16) -> Vec<u8> {
    let src: Ipv6Addr = src.parse().unwrap();
    let dst: Ipv6Addr = dst.parse().unwrap();
    let mut frame = ethernet_header(0x86dd);
    let mut header = vec![0u8; 40];
    header[0] = 0x60;
    header[6] = next;
    header[7] = 64; // hop limit
    header[8..24].copy_from_slice(&src.octets());
    header[24..40].copy_from_slice(&dst.octets());
    frame.extend(header);
    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&[0u8; 16]);
    frame
}

/// An Ethernet IPv6 frame whose next-header is a fragment header carrying `real_next`.
pub fn ipv6_fragment_frame(real_next: u8, src: &str, dst: &str) -> Vec<u8> {
    let mut frame = ipv6_frame(0x2c, src, dst, 0, 0);
    // The fragment header replaces the L4 bytes: its first byte names the real protocol.
    frame[54] = real_next;
    frame
}

/// An Ethernet ARP frame with the given sender and target protocol addresses.
pub fn arp_frame(sender: &str, target: &str) -> Vec<u8> {
    let sender: Ipv4Addr = sender.parse().unwrap();
    let target: Ipv4Addr = target.parse().unwrap();
    let mut frame = ethernet_header(0x0806);
    let mut body = vec![0u8; 28];
    body[0..2].copy_from_slice(&1u16.to_be_bytes()); // Ethernet
    body[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4
    body[4] = 6;
    body[5] = 4;
    body[6..8].copy_from_slice(&1u16.to_be_bytes()); // request
    body[14..18].copy_from_slice(&sender.octets());
    body[24..28].copy_from_slice(&target.octets());
    frame.extend(body);
    frame
}

/// A BSD loopback (Null link) IPv4 frame: 4-byte address-family word, then the IP packet.
pub fn null_ipv4_frame(proto: u8, src: &str, dst: &str, sport: u16, dport: u16) -> Vec<u8> {
    let mut frame = vec![0u8; 4];
    BigEndian::write_u32(&mut frame[0..4], 2); // AF_INET
    frame.extend(ipv4_body(
        proto,
        src.parse().unwrap(),
        dst.parse().unwrap(),
        sport,
        dport,
        5,
        0,
    ));
    frame
}

// SPDX-License-Identifier: (Apache-2.0 OR MIT)

// Expected instruction streams for protocol-only primitives: `ether proto`, `ip proto`,
// `ip6 proto`, bare link families and bare L4 names with their dual-carrier emission.

mod common;

use common::*;
use pcapfilter::{compile, CompileError, LinkType};

fn run(expression: &str) -> Result<Vec<pcapfilter::Instruction>, CompileError> {
    compile(expression, LinkType::Ethernet, &StaticResolver::new())
}

fn ether_proto_expected(value: u32) -> Vec<pcapfilter::Instruction> {
    vec![ldh(12), jeq(value, 0, 1), ret_keep(), ret_drop()]
}

#[test]
fn test_unknown_protocol() {
    assert_eq!(
        run("ether proto foo"),
        Err(CompileError::UnknownProtocol("foo".to_string()))
    );
    assert_eq!(
        run("ip proto abc"),
        Err(CompileError::UnknownProtocol("abc".to_string()))
    );
    // Recognized name, but only reachable through LLC, which is not emitted.
    assert_eq!(
        run("ether proto iso"),
        Err(CompileError::UnknownProtocol("iso".to_string()))
    );
}

#[test]
fn test_ether_proto() {
    assert_eq!(run("ether proto ip").unwrap(), ether_proto_expected(0x800));
    assert_eq!(
        run("ether proto ip6").unwrap(),
        ether_proto_expected(0x86dd)
    );
    assert_eq!(run("ether proto arp").unwrap(), ether_proto_expected(0x806));
    assert_eq!(
        run("ether proto rarp").unwrap(),
        ether_proto_expected(0x8035)
    );
}

#[test]
fn test_bare_link_families() {
    // `ip`, `ip6`, `arp` and `rarp` alone are EtherType checks.
    assert_eq!(run("ip").unwrap(), ether_proto_expected(0x800));
    assert_eq!(run("ip6").unwrap(), ether_proto_expected(0x86dd));
    assert_eq!(run("arp").unwrap(), ether_proto_expected(0x806));
    assert_eq!(run("rarp").unwrap(), ether_proto_expected(0x8035));
}

#[test]
fn test_ip_proto() {
    assert_eq!(
        run("ip proto tcp").unwrap(),
        vec![
            ldh(12),
            jeq(0x800, 0, 3),
            ldb(23),
            jeq(0x06, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
    assert_eq!(
        run("ip proto udp").unwrap(),
        vec![
            ldh(12),
            jeq(0x800, 0, 3),
            ldb(23),
            jeq(0x11, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
    assert_eq!(
        run("ip proto icmp").unwrap(),
        vec![
            ldh(12),
            jeq(0x800, 0, 3),
            ldb(23),
            jeq(0x01, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
}

#[test]
fn test_ip6_proto() {
    // The IPv6 compare includes the continuation-header second chance.
    assert_eq!(
        run("ip6 proto tcp").unwrap(),
        vec![
            ldh(12),
            jeq(0x86dd, 0, 6),
            ldb(20),
            jeq(0x06, 3, 0),
            jeq(0x2c, 0, 3),
            ldb(54),
            jeq(0x06, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
}

#[test]
fn test_bare_udp() {
    assert_eq!(
        run("udp").unwrap(),
        vec![
            ldh(12),
            jeq(0x86dd, 0, 5),
            ldb(20),
            jeq(0x11, 6, 0),
            jeq(0x2c, 0, 6),
            ldb(54),
            jeq(0x11, 3, 4),
            jeq(0x800, 0, 3),
            ldb(23),
            jeq(0x11, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
}

#[test]
fn test_bare_tcp_icmp_sctp() {
    for (expression, value) in [("tcp", 0x06u32), ("icmp", 0x01), ("sctp", 0x84)] {
        assert_eq!(
            run(expression).unwrap(),
            vec![
                ldh(12),
                jeq(0x86dd, 0, 5),
                ldb(20),
                jeq(value, 6, 0),
                jeq(0x2c, 0, 6),
                ldb(54),
                jeq(value, 3, 4),
                jeq(0x800, 0, 3),
                ldb(23),
                jeq(value, 0, 1),
                ret_keep(),
                ret_drop(),
            ],
            "{expression}"
        );
    }
}

#[test]
fn test_bare_ether_type_sub_protocol() {
    // `atalk` and friends only exist at the link layer, so alone they are EtherType checks.
    assert_eq!(run("atalk").unwrap(), ether_proto_expected(0x809b));
    assert_eq!(run("ipx").unwrap(), ether_proto_expected(0x8137));
}

#[test]
fn test_ether_alone_is_parse_error() {
    assert_eq!(run("ether"), Err(CompileError::Parse));
    assert_eq!(run("ether abc"), Err(CompileError::Parse));
    assert_eq!(run("ether aa:bb:cc:dd:ee:ff"), Err(CompileError::Parse));
    assert_eq!(run("fddi"), Err(CompileError::Parse));
}

#[test]
fn test_proto_shapes() {
    for expression in ["ip", "udp", "tcp", "ip proto tcp", "ip6 proto udp", "ether proto arp"] {
        let prog = run(expression).unwrap();
        check_program(&prog);
    }
}

// MAC address primitives.

#[test]
fn test_invalid_ethernet_address() {
    for expression in [
        "ether dst abc",
        "ether src abc",
        "ether host abc",
        "ether src or dst abc",
    ] {
        assert_eq!(
            run(expression),
            Err(CompileError::InvalidEthernetAddress("abc".to_string())),
            "{expression}"
        );
    }
}

#[test]
fn test_ether_host() {
    let expected = vec![
        ld(8),
        jeq(0xccddeeff, 0, 2),
        ldh(6),
        jeq(0xaabb, 4, 0),
        ld(2),
        jeq(0xccddeeff, 0, 3),
        ldh(0),
        jeq(0xaabb, 0, 1),
        ret_keep(),
        ret_drop(),
    ];
    assert_eq!(run("ether host aa:bb:cc:dd:ee:ff").unwrap(), expected);
    assert_eq!(run("ether src or dst aa:bb:cc:dd:ee:ff").unwrap(), expected);
}

#[test]
fn test_ether_src() {
    assert_eq!(
        run("ether src aa:bb:cc:dd:ee:ff").unwrap(),
        vec![
            ld(8),
            jeq(0xccddeeff, 0, 3),
            ldh(6),
            jeq(0xaabb, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
}

#[test]
fn test_ether_dst() {
    assert_eq!(
        run("ether dst aa:bb:cc:dd:ee:ff").unwrap(),
        vec![
            ld(2),
            jeq(0xccddeeff, 0, 3),
            ldh(0),
            jeq(0xaabb, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
}

#[test]
fn test_ether_src_and_dst() {
    assert_eq!(
        run("ether src and dst aa:bb:cc:dd:ee:ff").unwrap(),
        vec![
            ld(8),
            jeq(0xccddeeff, 0, 7),
            ldh(6),
            jeq(0xaabb, 0, 5),
            ld(2),
            jeq(0xccddeeff, 0, 3),
            ldh(0),
            jeq(0xaabb, 0, 1),
            ret_keep(),
            ret_drop(),
        ]
    );
}

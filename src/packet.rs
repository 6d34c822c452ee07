//! Raw ICMP probe construction and reply decoding for both address families.

use std::net::{IpAddr, Ipv4Addr};

use pnet::packet::icmp::{self, echo_reply::EchoReplyPacket, echo_request::MutableEchoRequestPacket, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{echo_request as icmpv6_echo, Icmpv6Packet, Icmpv6Types};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::Packet;
use thiserror::Error;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const ICMP_ECHO_LEN: usize = 8;

/// Low-delay TOS, mirrored into DSCP/ECN on outgoing probes.
const PROBE_TOS: u8 = 0x10;

/// Total size of an outgoing IPv4 probe: header plus echo request, no payload.
pub const PROBE_SIZE_V4: usize = IPV4_HEADER_LEN + ICMP_ECHO_LEN;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("ICMP message too short")]
    ShortMessage,
    #[error("not an ICMP packet")]
    UnsupportedProtocol,
}

/// A reply reduced to the fields probe matching cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The destination answered our echo request.
    EchoReply { id: u16 },
    /// Any error message carrying the invoking datagram: time exceeded,
    /// destination unreachable or parameter problem. `dst`, `id` and `ttl`
    /// come from the embedded original header.
    TimeExceeded { dst: IpAddr, id: u16, ttl: u8 },
    /// Some other ICMP message; not ours to handle.
    Other,
}

/// Builds a complete IPv4 datagram for one probe. The identifier is written
/// into both the IP identification field and the echo header so error
/// replies and echo replies can be matched the same way.
///
/// The source address stays zero; the kernel fills in the egress address
/// when the header-included socket sends it.
// TODO: reuse the probe buffer across sends instead of allocating per probe
pub fn build_probe_v4(dst: Ipv4Addr, ttl: u8, id: u16) -> Result<Vec<u8>, PacketError> {
    let mut datagram = vec![0u8; PROBE_SIZE_V4];
    let (header, message) = datagram.split_at_mut(IPV4_HEADER_LEN);

    let mut echo = MutableEchoRequestPacket::new(message).ok_or(PacketError::ShortMessage)?;
    echo.set_icmp_type(IcmpTypes::EchoRequest);
    echo.set_identifier(id);
    echo.set_sequence_number(id);
    let sum = {
        let view = IcmpPacket::new(echo.packet()).ok_or(PacketError::ShortMessage)?;
        icmp::checksum(&view)
    };
    echo.set_checksum(sum);

    let mut ip = MutableIpv4Packet::new(header).ok_or(PacketError::ShortMessage)?;
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_dscp(PROBE_TOS >> 2);
    ip.set_ecn(PROBE_TOS & 0x3);
    ip.set_total_length(PROBE_SIZE_V4 as u16);
    ip.set_identification(id);
    ip.set_ttl(ttl);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
    ip.set_destination(dst);
    let sum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(sum);

    Ok(datagram)
}

/// Builds an ICMPv6 echo request. Only the message is built here; hop limit
/// is a socket option and the kernel computes the checksum on raw ICMPv6
/// sockets.
pub fn build_probe_v6(id: u16) -> Result<Vec<u8>, PacketError> {
    let mut message = vec![0u8; ICMP_ECHO_LEN];
    let mut echo =
        icmpv6_echo::MutableEchoRequestPacket::new(&mut message).ok_or(PacketError::ShortMessage)?;
    echo.set_icmpv6_type(Icmpv6Types::EchoRequest);
    echo.set_identifier(id);
    echo.set_sequence_number(id);
    Ok(message)
}

/// Decodes a raw IPv4 datagram as received from the socket, IP header included.
pub fn decode_v4(datagram: &[u8]) -> Result<Decoded, PacketError> {
    let ip = Ipv4Packet::new(datagram).ok_or(PacketError::ShortMessage)?;
    if ip.get_version() != 4 {
        return Err(PacketError::UnsupportedProtocol);
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return Err(PacketError::UnsupportedProtocol);
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_HEADER_LEN || datagram.len() < header_len + ICMP_ECHO_LEN {
        return Err(PacketError::ShortMessage);
    }

    let message = IcmpPacket::new(&datagram[header_len..]).ok_or(PacketError::ShortMessage)?;
    match message.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let echo =
                EchoReplyPacket::new(&datagram[header_len..]).ok_or(PacketError::ShortMessage)?;
            Ok(Decoded::EchoReply { id: echo.get_identifier() })
        }
        IcmpTypes::TimeExceeded
        | IcmpTypes::DestinationUnreachable
        | IcmpTypes::ParameterProblem => decode_embedded_v4(message.payload()),
        _ => Ok(Decoded::Other),
    }
}

/// The error message body: four unused bytes, then the invoking datagram.
fn decode_embedded_v4(body: &[u8]) -> Result<Decoded, PacketError> {
    if body.len() < 4 + IPV4_HEADER_LEN {
        return Err(PacketError::ShortMessage);
    }
    let original = Ipv4Packet::new(&body[4..]).ok_or(PacketError::ShortMessage)?;
    if original.get_version() != 4 {
        return Err(PacketError::UnsupportedProtocol);
    }
    Ok(Decoded::TimeExceeded {
        dst: IpAddr::V4(original.get_destination()),
        id: original.get_identification(),
        ttl: original.get_ttl(),
    })
}

/// Decodes an ICMPv6 message as received from the socket. Raw ICMPv6 sockets
/// hand us the message without the IP header.
///
/// IPv6 probes carry no identification field, so the probe id is recovered
/// from the low 16 bits of the embedded flow label. The kernel picks the flow
/// label on send, which is why IPv6 matching stays loose upstream.
pub fn decode_v6(message: &[u8]) -> Result<Decoded, PacketError> {
    let icmp = Icmpv6Packet::new(message).ok_or(PacketError::ShortMessage)?;
    match icmp.get_icmpv6_type() {
        Icmpv6Types::EchoReply => {
            // The reply shares the request layout.
            let echo =
                icmpv6_echo::EchoRequestPacket::new(message).ok_or(PacketError::ShortMessage)?;
            Ok(Decoded::EchoReply { id: echo.get_identifier() })
        }
        Icmpv6Types::TimeExceeded
        | Icmpv6Types::DestinationUnreachable
        | Icmpv6Types::ParameterProblem => {
            let body = icmp.payload();
            if body.len() < 4 + IPV6_HEADER_LEN {
                return Err(PacketError::ShortMessage);
            }
            let original = Ipv6Packet::new(&body[4..]).ok_or(PacketError::ShortMessage)?;
            if original.get_version() != 6 {
                return Err(PacketError::UnsupportedProtocol);
            }
            Ok(Decoded::TimeExceeded {
                dst: IpAddr::V6(original.get_destination()),
                id: (original.get_flow_label() & 0xffff) as u16,
                ttl: original.get_hop_limit(),
            })
        }
        _ => Ok(Decoded::Other),
    }
}

//! Build replay captures from libpcap files.
//!
//! Frames are dissected as Ethernet / IPv4 / TCP or UDP. Every non-empty
//! transport payload that passes the [`PayloadFilter`] becomes one packet,
//! stamped in milliseconds relative to the first kept frame. The first packet
//! therefore sits at time zero and is revealed as soon as playback exists.

use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet as _;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::Packet;
use crate::error::Result;

const PROGRESS_EVERY: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportFilter {
    Tcp,
    Udp,
    #[default]
    Any,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadFilter {
    pub transport: TransportFilter,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl PayloadFilter {
    fn accepts(&self, transport: TransportFilter, src_port: u16, dst_port: u16) -> bool {
        let transport_ok = self.transport == TransportFilter::Any || self.transport == transport;
        transport_ok
            && self.src_port.is_none_or(|port| port == src_port)
            && self.dst_port.is_none_or(|port| port == dst_port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub frames: u64,
    pub kept: u64,
    pub skipped: u64,
    pub duration_ms: u64,
}

struct Segment<'a> {
    transport: TransportFilter,
    src_port: u16,
    dst_port: u16,
    payload: &'a [u8],
}

/// Read a pcap stream and return the matching payloads as replay packets.
pub fn import<R: Read>(reader: R, filter: &PayloadFilter) -> Result<(Vec<Packet>, ImportSummary)> {
    let mut capture = PcapReader::new(reader)?;
    let datalink = capture.header().datalink;
    if datalink != DataLink::ETHERNET {
        warn!("Capture link type is {:?}; only Ethernet frames will be dissected", datalink);
    }

    let mut packets = Vec::new();
    let mut summary = ImportSummary::default();
    let mut first_timestamp: Option<Duration> = None;

    while let Some(frame) = capture.next_packet() {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Stopping at unreadable frame #{}: {}", summary.frames + 1, e);
                break;
            }
        };
        summary.frames += 1;
        if summary.frames % PROGRESS_EVERY == 0 {
            info!("Imported {} frames so far ({} kept)...", summary.frames, summary.kept);
        }

        let Some(segment) = dissect(&frame.data) else {
            summary.skipped += 1;
            continue;
        };
        if segment.payload.is_empty()
            || !filter.accepts(segment.transport, segment.src_port, segment.dst_port)
        {
            summary.skipped += 1;
            continue;
        }

        let base = *first_timestamp.get_or_insert(frame.timestamp);
        let timestamp = frame.timestamp.checked_sub(base).unwrap_or_default().as_millis() as u64;
        debug!(
            "Frame {}: {:?} {} -> {} ({} bytes) at {} ms",
            summary.frames,
            segment.transport,
            segment.src_port,
            segment.dst_port,
            segment.payload.len(),
            timestamp
        );
        packets.push(Packet::new(timestamp, segment.payload.to_vec()));
        summary.kept += 1;
        summary.duration_ms = summary.duration_ms.max(timestamp);
    }

    if packets.is_empty() {
        warn!("No payloads matched the filter; the capture will be empty");
    }
    Ok((packets, summary))
}

fn dissect(frame: &[u8]) -> Option<Segment<'_>> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    let offset = EthernetPacket::minimum_packet_size() + ipv4_payload_offset(&ipv4)?;

    match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv4.payload())?;
            let header_len = usize::from(tcp.get_data_offset()) * 4;
            let start = offset + header_len;
            let end = offset + ipv4_payload_len(&ipv4)?;
            Some(Segment {
                transport: TransportFilter::Tcp,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                payload: frame.get(start..end)?,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv4.payload())?;
            let start = offset + UdpPacket::minimum_packet_size();
            let end = offset + ipv4_payload_len(&ipv4)?;
            Some(Segment {
                transport: TransportFilter::Udp,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                payload: frame.get(start..end)?,
            })
        }
        _ => None,
    }
}

fn ipv4_payload_offset(ipv4: &Ipv4Packet<'_>) -> Option<usize> {
    let header_len = usize::from(ipv4.get_header_length()) * 4;
    (header_len >= Ipv4Packet::minimum_packet_size()).then_some(header_len)
}

fn ipv4_payload_len(ipv4: &Ipv4Packet<'_>) -> Option<usize> {
    usize::from(ipv4.get_total_length()).checked_sub(ipv4_payload_offset(ipv4)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::{PcapPacket, PcapWriter};

    fn frame(protocol: u8, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let transport_header = if protocol == 6 { 20 } else { 8 };
        let ip_total = 20 + transport_header + payload.len();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2, 0x08, 0x00]);
        bytes.extend_from_slice(&[0x45, 0]);
        bytes.extend_from_slice(&(ip_total as u16).to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0, 64, protocol, 0, 0]);
        bytes.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        bytes.extend_from_slice(&src_port.to_be_bytes());
        bytes.extend_from_slice(&dst_port.to_be_bytes());
        if protocol == 6 {
            bytes.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x18, 0xFF, 0xFF, 0, 0, 0, 0]);
        } else {
            bytes.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
            bytes.extend_from_slice(&[0, 0]);
        }
        bytes.extend_from_slice(payload);
        // Ethernet minimum frame padding must not leak into payloads
        bytes.resize(bytes.len().max(60), 0);
        bytes
    }

    fn pcap(frames: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        for (ms, data) in frames {
            let packet = PcapPacket::new(Duration::from_millis(*ms), data.len() as u32, data);
            writer.write_packet(&packet).unwrap();
        }
        writer.into_writer()
    }

    #[test]
    fn test_import_relative_timestamps() {
        let bytes = pcap(&[
            (5_000, frame(6, 9000, 40000, b"hello")),
            (5_250, frame(6, 9000, 40000, b"world")),
            (5_900, frame(17, 7000, 7001, b"udp")),
        ]);

        let (packets, summary) = import(&bytes[..], &PayloadFilter::default()).unwrap();
        assert_eq!(
            packets,
            vec![
                Packet::new(0, b"hello".to_vec()),
                Packet::new(250, b"world".to_vec()),
                Packet::new(900, b"udp".to_vec()),
            ]
        );
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.kept, 3);
        assert_eq!(summary.duration_ms, 900);
    }

    #[test]
    fn test_filter_by_transport_and_port() {
        let bytes = pcap(&[
            (0, frame(17, 7000, 7001, b"noise")),
            (10, frame(6, 9000, 40000, b"keep")),
            (20, frame(6, 40000, 9000, b"request")),
            (30, frame(6, 9000, 40000, b"")),
            (40, frame(6, 9000, 40000, b"also")),
        ]);
        let filter = PayloadFilter {
            transport: TransportFilter::Tcp,
            src_port: Some(9000),
            dst_port: None,
        };

        let (packets, summary) = import(&bytes[..], &filter).unwrap();
        assert_eq!(
            packets,
            vec![Packet::new(0, b"keep".to_vec()), Packet::new(30, b"also".to_vec())]
        );
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.skipped, 3);
    }

    #[test]
    fn test_non_ip_frames_skipped() {
        let mut arp = frame(17, 1, 2, b"x");
        arp[12] = 0x08;
        arp[13] = 0x06;
        let bytes = pcap(&[(0, arp)]);

        let (packets, summary) = import(&bytes[..], &PayloadFilter::default()).unwrap();
        assert!(packets.is_empty());
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_not_a_pcap() {
        assert!(import(&b"definitely not pcap"[..], &PayloadFilter::default()).is_err());
    }
}

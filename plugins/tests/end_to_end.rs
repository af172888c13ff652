//! Full-pipeline test: a synthetic capture file runs through the offline
//! runtime with the default plugin set, and the emitted flow rows are
//! checked for pairing, direction and fragment handling.

use kestrel_core::config::RuntimeConfig;
use kestrel_core::plugin::PluginRegistry;
use kestrel_core::Runtime;
use kestrel_plugins::{BasicFlow, TextSink};

use std::fs::{self, File};
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

/// Classic little-endian pcap with microsecond timestamps, DLT_EN10MB.
fn write_pcap(path: &std::path::Path, packets: &[(i64, u32, Vec<u8>)]) {
    let mut out = File::create(path).unwrap();
    out.write_u32::<LittleEndian>(0xa1b2_c3d4).unwrap();
    out.write_u16::<LittleEndian>(2).unwrap();
    out.write_u16::<LittleEndian>(4).unwrap();
    out.write_i32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(65535).unwrap();
    out.write_u32::<LittleEndian>(1).unwrap();
    for (sec, usec, data) in packets {
        out.write_u32::<LittleEndian>(*sec as u32).unwrap();
        out.write_u32::<LittleEndian>(*usec).unwrap();
        out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        out.write_all(data).unwrap();
    }
}

fn eth(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![2, 0, 0, 0, 0, 2, 2, 0, 0, 0, 0, 1, 0x08, 0x00];
    frame.extend_from_slice(payload);
    frame
}

fn ipv4(src: [u8; 4], dst: [u8; 4], proto: u8, id: u16, frag: u16, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len() as u16;
    let mut pkt = vec![0x45, 0];
    pkt.extend_from_slice(&total.to_be_bytes());
    pkt.extend_from_slice(&id.to_be_bytes());
    pkt.extend_from_slice(&frag.to_be_bytes());
    pkt.push(64);
    pkt.push(proto);
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(&src);
    pkt.extend_from_slice(&dst);
    pkt.extend_from_slice(payload);
    pkt
}

fn udp(sport: u16, dport: u16, len: usize) -> Vec<u8> {
    let mut dgram = Vec::new();
    dgram.extend_from_slice(&sport.to_be_bytes());
    dgram.extend_from_slice(&dport.to_be_bytes());
    dgram.extend_from_slice(&((8 + len) as u16).to_be_bytes());
    dgram.extend_from_slice(&[0, 0]);
    dgram.extend_from_slice(&vec![0u8; len]);
    dgram
}

fn tcp_syn(sport: u16, dport: u16) -> Vec<u8> {
    let mut seg = Vec::new();
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
    seg.push(0x50);
    seg.push(0x02); // SYN
    seg.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
    seg
}

#[test]
fn offline_run_produces_paired_flow_rows() {
    let dir = tempfile::tempdir().unwrap();
    let pcap_path = dir.path().join("trace.pcap");
    let prefix = dir.path().join("out").to_string_lossy().into_owned();

    let packets = vec![
        // a query from the well-known side and its reply: the responder
        // sent first, so the reply side is the A flow
        (100, 0, eth(&ipv4([10, 0, 0, 1], [10, 0, 0, 2], 17, 10, 0, &udp(53, 40000, 32)))),
        (100, 500_000, eth(&ipv4([10, 0, 0, 2], [10, 0, 0, 1], 17, 11, 0, &udp(40000, 53, 72)))),
        // a lone SYN stays an A flow
        (101, 0, eth(&ipv4([192, 168, 1, 10], [192, 168, 1, 20], 6, 12, 0, &tcp_syn(33333, 80)))),
        // a two-fragment UDP train
        (
            102,
            0,
            eth(&ipv4([10, 1, 0, 1], [10, 1, 0, 2], 17, 0xbeef, 0x2000, &udp(1111, 2222, 64))),
        ),
        (
            102,
            1000,
            eth(&ipv4([10, 1, 0, 1], [10, 1, 0, 2], 17, 0xbeef, 185, &vec![0u8; 64])),
        ),
    ];
    write_pcap(&pcap_path, &packets);

    let mut config = RuntimeConfig::offline(pcap_path.to_string_lossy().into_owned());
    config.output.prefix = Some(prefix.clone());
    config.flowtable.scale_factor = 0.001;

    let registry = PluginRegistry::build(vec![
        Box::new(BasicFlow::new()),
        Box::new(TextSink::new()),
    ])
    .unwrap();
    let mut runtime = Runtime::new(config, registry).unwrap();
    runtime.run().unwrap();

    let flows = fs::read_to_string(format!("{prefix}_flows.txt")).unwrap();
    let lines: Vec<&str> = flows.lines().collect();
    assert!(lines[0].starts_with("%dir\tflowInd\tflowStat"));

    // four flows: the paired pair, the lone SYN, the fragment train
    let rows: Vec<Vec<&str>> = lines[1..].iter().map(|l| l.split('\t').collect()).collect();
    assert_eq!(rows.len(), 4);

    let col = |row: &Vec<&str>, i: usize| row[i].to_string();
    // columns: 0 dir, 1 flowInd, 8 srcIP, 9 srcPort, 11 dstPort, 13 numPktsSnt
    let reply = rows.iter().find(|r| col(r, 9) == "40000").unwrap();
    let query = rows.iter().find(|r| col(r, 9) == "53").unwrap();
    assert_eq!(col(reply, 0), "A");
    assert_eq!(col(query, 0), "B");
    assert_eq!(col(reply, 1), col(query, 1));

    // the A half of a pair is printed first
    let reply_pos = rows.iter().position(|r| col(r, 9) == "40000").unwrap();
    let query_pos = rows.iter().position(|r| col(r, 9) == "53").unwrap();
    assert!(reply_pos < query_pos);

    let syn = rows.iter().find(|r| col(r, 9) == "33333").unwrap();
    assert_eq!(col(syn, 0), "A");

    // both fragments were attributed to one flow
    let frag = rows.iter().find(|r| col(r, 9) == "1111").unwrap();
    assert_eq!(col(frag, 13), "2");
    let flow_stat = u64::from_str_radix(col(frag, 2).trim_start_matches("0x"), 16).unwrap();
    // IPv4 fragmentation seen, train completed
    assert_ne!(flow_stat & 0x0000_0010_0000_0000, 0);
    assert_eq!(flow_stat & 0x0000_0080_0000_0000, 0);
}

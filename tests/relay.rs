use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::Receiver;
use ez_relay::{Conversion, MediaType, RelayServer, ServerConfig};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn server() -> RelayServer {
    init_logger();
    let config = ServerConfig::default().set_poll_timeout(Duration::from_millis(10));
    RelayServer::new(config).expect("Failed to create relay server")
}

/// Polls `server` until `rx` has produced `len` bytes or time runs out.
fn collect(server: &mut RelayServer, rx: &Receiver<bytes::Bytes>, len: usize) -> BytesMut {
    let mut out = BytesMut::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while out.len() < len && Instant::now() < deadline {
        server.poll_once().expect("Failed to poll");
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
    }
    out
}

fn ts_packet(counter: u8) -> Vec<u8> {
    let mut packet = vec![0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x01;
    packet[2] = 0x00;
    packet[3] = 0x10 | (counter & 0x0F);
    packet
}

#[test]
fn udp_ts_input_reaches_both_renditions() {
    let mut server = server();
    server
        .create_channel("udp://127.0.0.1:0", "tvb")
        .expect("Failed to create channel");
    server.add_output("tvb", "http://127.0.0.1:80/tvb_flv").unwrap();
    server.add_output("tvb", "http://127.0.0.1:80/tvb_ts").unwrap();
    server.start_all().expect("Failed to start channels");

    let channel = server.channel("tvb").expect("Channel missing");
    let addr = channel.local_addr().expect("Failed to read local address");
    let flv = channel.outputs()[0].subscribe();
    let ts = channel.outputs()[1].subscribe();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut sent = Vec::new();
    for counter in 0..4 {
        let packet = ts_packet(counter);
        sender.send_to(&packet, addr).unwrap();
        sent.extend_from_slice(&packet);
    }

    let got_flv = collect(&mut server, &flv, sent.len());
    assert_eq!(&got_flv[..], &sent[..]);
    let got_ts = collect(&mut server, &ts, sent.len());
    assert_eq!(&got_ts[..], &sent[..]);

    let channel = server.channel("tvb").unwrap();
    assert_eq!(channel.media_type(), MediaType::Ts);
    assert_eq!(channel.outputs()[0].conversion(), Some(Conversion::TsToFlv));
    assert_eq!(channel.outputs()[1].conversion(), Some(Conversion::TsToTs));
    assert_eq!(channel.stats().bytes_received, sent.len() as u64);
    assert_eq!(channel.context().attachments(), 1);

    server.shutdown();
    assert!(!server.channel("tvb").unwrap().is_running());
}

#[test]
fn tcp_flv_client_feeds_late_output() {
    let mut server = server();
    server.create_channel("tcp://127.0.0.1:0", "cam").unwrap();
    server.start_channel("cam").unwrap();
    let addr = server.channel("cam").unwrap().local_addr().unwrap();

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client.write_all(b"FLV\x01\x05\x00\x00\x00\x09").unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while server.channel("cam").unwrap().media_type() != MediaType::Flv {
        assert!(Instant::now() < deadline, "format never detected");
        server.poll_once().unwrap();
    }

    // Declared after detection: typed immediately and attached
    server.add_output("cam", "rtmp://127.0.0.1/live/cam").unwrap();
    let rtmp = server.channel("cam").unwrap().outputs()[0].subscribe();
    assert_eq!(
        server.channel("cam").unwrap().outputs()[0].conversion(),
        Some(Conversion::FlvToFlv)
    );

    client.write_all(b"\x09\x00\x00\x00\x00").unwrap();
    let got = collect(&mut server, &rtmp, 14);
    assert!(got.starts_with(b"FLV"));
    assert!(got.ends_with(b"\x09\x00\x00\x00\x00"));
}

#[test]
fn spawned_server_stops_from_another_thread() {
    let mut server = server();
    server.create_channel("udp://127.0.0.1:0", "bg").unwrap();
    server.start_all().unwrap();

    let handle = server.spawn().expect("Failed to spawn relay server");
    let stop = handle.stop_handle();
    assert!(!stop.is_stopped());

    std::thread::spawn(move || stop.stop())
        .join()
        .expect("Stopper thread panicked");
    handle.stop().expect("Relay server thread failed");
}

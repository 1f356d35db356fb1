//! End-to-end runs over the UDP backend on loopback.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rxprobe::config::ReceiverConfig;
use rxprobe::nic::QueueConfig;
use rxprobe::nic::udp::UdpNic;
use rxprobe::session::{Outcome, ReceiveSession, RecvError};
use rxprobe::signal::SignalFlags;

fn open(cfg: &ReceiverConfig) -> (UdpNic, SocketAddr) {
    let nic = UdpNic::open("127.0.0.1:0".parse().unwrap(), QueueConfig::for_receiver(cfg)).unwrap();
    let addr = nic.local_addr().unwrap();
    (nic, addr)
}

/// Sends each sequence number as a 64-byte datagram, paced so loopback
/// keeps up.
fn spawn_sender(to: SocketAddr, seqs: Vec<u32>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut datagram = [0u8; 64];
        for (i, seq) in seqs.into_iter().enumerate() {
            datagram[..4].copy_from_slice(&seq.to_le_bytes());
            socket.send_to(&datagram, to).unwrap();
            if i % 32 == 31 {
                thread::sleep(Duration::from_micros(200));
            }
        }
    })
}

/// Requests termination after `after`, so a lost final packet cannot hang
/// the test.
fn spawn_watchdog(flags: Arc<SignalFlags>, after: Duration) {
    thread::spawn(move || {
        thread::sleep(after);
        flags.request_terminate();
    });
}

#[test]
fn stream_over_loopback_completes() {
    let cfg = ReceiverConfig {
        iterations: 2_000,
        buffer_count: 64,
        ..ReceiverConfig::default()
    };
    let (mut nic, addr) = open(&cfg);
    let mut session = ReceiveSession::new(cfg, &mut nic).unwrap();
    let flags = Arc::new(SignalFlags::new());
    spawn_watchdog(flags.clone(), Duration::from_secs(20));

    let sender = spawn_sender(addr, (0..2_000).collect());
    let outcome = session.run(&mut nic, &flags).unwrap();
    sender.join().unwrap();

    assert!(
        matches!(outcome, Outcome::AllReceived | Outcome::Lossy),
        "{outcome:?}"
    );
    let report = session.report().unwrap();
    assert_eq!(report.received + report.remaining, 2_000);
    assert_eq!(session.tracker().out_of_order(), 0);
    if outcome == Outcome::AllReceived {
        assert_eq!(report.total_gaps, 0);
    }
}

#[test]
fn skipped_sequences_show_up_as_gaps() {
    let cfg = ReceiverConfig {
        iterations: 100,
        buffer_count: 32,
        ..ReceiverConfig::default()
    };
    let (mut nic, addr) = open(&cfg);
    let mut session = ReceiveSession::new(cfg, &mut nic).unwrap();
    let flags = Arc::new(SignalFlags::new());
    spawn_watchdog(flags.clone(), Duration::from_secs(20));

    let seqs: Vec<u32> = (0..100).filter(|s| !(40..50).contains(s)).collect();
    let sender = spawn_sender(addr, seqs);
    let outcome = session.run(&mut nic, &flags).unwrap();
    sender.join().unwrap();

    assert_eq!(outcome, Outcome::Lossy);
    let report = session.report().unwrap();
    assert!(report.remaining >= 10);
    assert!(report.gaps.iter().any(|g| g.start <= 40 && g.end >= 49));
}

#[test]
fn sequence_past_target_is_fatal() {
    let cfg = ReceiverConfig {
        iterations: 100,
        buffer_count: 8,
        ..ReceiverConfig::default()
    };
    let (mut nic, addr) = open(&cfg);
    let mut session = ReceiveSession::new(cfg, &mut nic).unwrap();
    let flags = Arc::new(SignalFlags::new());
    spawn_watchdog(flags.clone(), Duration::from_secs(20));

    spawn_sender(addr, vec![5_000]).join().unwrap();
    let err = session.run(&mut nic, &flags).unwrap_err();
    assert!(matches!(
        err,
        RecvError::SequenceOutOfRange {
            seq: 5_000,
            target: 100,
            ..
        }
    ));
}

//! Receive benchmark binary.
//!
//! Receives a sequenced packet stream on one queue and reports loss and
//! packet rate.
//!
//! # Usage
//!
//! ```sh
//! rxprobe -n 1000000 eth2          # raw frames on an interface (CAP_NET_RAW)
//! rxprobe -n 1000000 3             # same, by interface index
//! rxprobe udp:0.0.0.0:9000         # UDP datagrams, no privileges needed
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: print the number of packets still expected. Twice in a row
//!   without progress: stop.
//! - `SIGTERM`: print progress and stop with exit status 1.

use std::net::SocketAddr;

use clap::Parser;
use core_affinity::CoreId;

use rxprobe::config::{ConfigError, DEFAULT_BUFFER_COUNT, DEFAULT_ITERATIONS};
use rxprobe::dump::HexDump;
use rxprobe::nic::packet::{PacketNic, resolve_interface};
use rxprobe::nic::udp::UdpNic;
use rxprobe::nic::{Nic, QueueConfig};
use rxprobe::signal::{self, SignalFlags};
use rxprobe::{ReceiveSession, ReceiverConfig, RecvError};

/// Bytes of the offending buffer shown on a sequence range violation.
const DUMP_LEN: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "rxprobe")]
#[command(version, about = "Single-stream receive benchmark and loss probe")]
struct Cli {
    /// Interface name, interface index, or udp:<addr:port>
    #[arg(value_parser = parse_source)]
    source: Source,

    /// Number of packets to receive
    #[arg(short = 'n', long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: u64,

    /// Physical address mode: lock buffer memory in RAM
    #[arg(short = 'p', long = "phys")]
    phys_mode: bool,

    /// Bytes of padding before the link header in each receive buffer
    #[arg(short = 'a', long = "align", default_value_t = 0)]
    rx_align: usize,

    /// Number of receive buffers
    #[arg(long, default_value_t = DEFAULT_BUFFER_COUNT)]
    buffers: usize,

    /// Pin the receive loop to this CPU
    #[arg(long)]
    cpu: Option<usize>,
}

#[derive(Debug, Clone)]
enum Source {
    Interface { name: String, index: u32 },
    Udp(SocketAddr),
}

fn parse_source(arg: &str) -> Result<Source, String> {
    if let Some(addr) = arg.strip_prefix("udp:") {
        return addr
            .parse()
            .map(Source::Udp)
            .map_err(|e| format!("invalid UDP address '{addr}': {e}"));
    }
    resolve_interface(arg)
        .map(|index| Source::Interface {
            name: arg.to_owned(),
            index,
        })
        .ok_or_else(|| format!("unknown interface '{arg}'"))
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = i32::from(e.use_stderr());
            let _ = e.print();
            std::process::exit(code);
        }
    };
    rxprobe::init_tracing();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    println!("# rxprobe {}", env!("CARGO_PKG_VERSION"));
    println!("# iterations: {}", cli.iterations);
    println!("# rx align: {}", cli.rx_align);

    let config = match receiver_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rxprobe: {e}");
            return 1;
        }
    };

    if let Some(cpu) = cli.cpu {
        if !core_affinity::set_for_current(CoreId { id: cpu }) {
            eprintln!("rxprobe: failed to pin to CPU {cpu}");
            return 1;
        }
        println!("# pinned to CPU {cpu}");
    }

    let signals = match signal::install() {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("rxprobe: failed to install signal handlers: {e}");
            return 1;
        }
    };

    let queue = QueueConfig::for_receiver(&config);

    let result = match cli.source {
        Source::Interface { name, index } => PacketNic::open(index, queue)
            .map_err(RecvError::from)
            .and_then(|mut nic| {
                let mac = nic.local_mac()?;
                println!("# interface {name} (index {index}), local MAC address {mac}");
                nic.install_receive_filter(mac);
                receive(config, &mut nic, signals)
            }),
        Source::Udp(addr) => UdpNic::open(addr, queue)
            .map_err(RecvError::from)
            .and_then(|mut nic| {
                if let Ok(local) = nic.local_addr() {
                    println!("# UDP socket bound to {local}");
                }
                receive(config, &mut nic, signals)
            }),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rxprobe: {e}");
            1
        }
    }
}

/// Run configuration from the command line, validated before any queue
/// geometry is derived from it.
fn receiver_config(cli: &Cli) -> Result<ReceiverConfig, ConfigError> {
    let config = ReceiverConfig {
        iterations: cli.iterations,
        rx_align: cli.rx_align,
        phys_mode: cli.phys_mode,
        buffer_count: cli.buffers,
        ..ReceiverConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn receive<N: Nic>(
    config: ReceiverConfig,
    nic: &mut N,
    signals: &SignalFlags,
) -> Result<i32, RecvError> {
    let mut session = ReceiveSession::new(config, nic)?;
    match session.run(nic, signals) {
        Ok(outcome) => {
            if let Some(report) = session.report() {
                println!("{report}");
            }
            Ok(outcome.exit_code())
        }
        Err(e) => {
            if let RecvError::SequenceOutOfRange { slot, .. } = &e {
                if let Ok(raw) = session.pool().raw(*slot) {
                    eprint!("{}", HexDump::new("received", &raw[..raw.len().min(DUMP_LEN)]));
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_source_parses_address() {
        match parse_source("udp:127.0.0.1:9000").unwrap() {
            Source::Udp(addr) => assert_eq!(addr.port(), 9000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_source("udp:nonsense").is_err());
    }

    #[test]
    fn numeric_source_is_an_index() {
        assert!(matches!(
            parse_source("7").unwrap(),
            Source::Interface { index: 7, .. }
        ));
    }

    #[test]
    fn unknown_interface_is_a_usage_error() {
        let err = parse_source("no-such-if0").unwrap_err();
        assert!(err.contains("unknown interface"));
    }

    #[test]
    fn flags_map_onto_config() {
        let cli = Cli::try_parse_from(["rxprobe", "-n", "500", "-p", "-a", "2", "udp:127.0.0.1:0"])
            .unwrap();
        assert_eq!(cli.iterations, 500);
        assert!(cli.phys_mode);
        assert_eq!(cli.rx_align, 2);
        assert_eq!(cli.buffers, DEFAULT_BUFFER_COUNT);
        assert!(Cli::try_parse_from(["rxprobe"]).is_err());
        assert!(Cli::try_parse_from(["rxprobe", "-n", "x", "lo"]).is_err());
    }

    #[test]
    fn oversized_align_is_rejected_before_queue_setup() {
        let cli = Cli::try_parse_from(["rxprobe", "-a", "4096", "udp:127.0.0.1:0"]).unwrap();
        assert!(matches!(
            receiver_config(&cli),
            Err(ConfigError::BufferTooSmall { rx_align: 4096, .. })
        ));
        let cli = Cli::try_parse_from(["rxprobe", "-a", &usize::MAX.to_string(), "lo"]).unwrap();
        assert!(receiver_config(&cli).is_err());
        assert_eq!(run(cli), 1);
    }

    #[test]
    fn valid_flags_pass_validation() {
        let cli = Cli::try_parse_from(["rxprobe", "-n", "10", "-a", "2", "udp:127.0.0.1:0"]).unwrap();
        let config = receiver_config(&cli).unwrap();
        assert_eq!(config.rx_align, 2);
        assert_eq!(config.iterations, 10);
    }
}

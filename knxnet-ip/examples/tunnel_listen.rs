//! Connects to a KNXnet/IP server over UDP as a tunneling client, logs
//! every inbound cEMI frame, then disconnects on Ctrl-C.
//!
//! Usage: tunnel_listen <server-ip>[:port]

use knx_support::logging;
use knxnet_ip::wire::Cri;
use knxnet_ip::{Connection, ConnectParams, ConnectionProfile, TransportKind};
use std::env;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    logging::init_default();

    let target = match env::args().nth(1) {
        Some(arg) => arg,
        None => {
            eprintln!("usage: tunnel_listen <server-ip>[:port]");
            process::exit(2);
        }
    };

    let server_control_endpoint = parse_endpoint(&target);

    let conn = Connection::new(TransportKind::Udp, ConnectionProfile::tunnel());
    conn.on_cemi(|payload| {
        println!("cemi: {payload:02X?}");
    });

    let params = ConnectParams {
        local_endpoint: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        server_control_endpoint,
        cri: Cri::tunnel(),
        use_nat: false,
        stream_registry: None,
    };

    if let Err(err) = conn.connect(params) {
        eprintln!("connect failed: {err}");
        process::exit(1);
    }

    println!(
        "connected, channel {} address {}",
        conn.channel_id(),
        conn.tunneling_address().map(|a| a.to_string()).unwrap_or_default()
    );

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = Arc::clone(&running);
    ctrlc_fallback(move || handler_running.store(false, Ordering::Release));

    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(200));
    }

    conn.close();
}

fn parse_endpoint(arg: &str) -> SocketAddrV4 {
    if let Ok(addr) = arg.parse::<SocketAddrV4>() {
        return addr;
    }
    match arg.parse::<Ipv4Addr>() {
        Ok(ip) => SocketAddrV4::new(ip, 3671),
        Err(_) => {
            eprintln!("not a valid IPv4 address or address:port: {arg}");
            process::exit(2);
        }
    }
}

/// No portable SIGINT handling without an extra dependency the rest of the
/// workspace does not otherwise need; spawns a thread that waits on stdin
/// closing instead, which is sufficient for a manual demo run.
fn ctrlc_fallback<F: FnOnce() + Send + 'static>(on_signal: F) {
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        on_signal();
    });
}

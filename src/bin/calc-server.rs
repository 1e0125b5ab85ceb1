use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use calc_rpc::{
    Calculator, DatagramReactor, Service, StreamReactor,
    server::{Concurrency, DatagramServer, StreamServer},
};
use clap::{Parser, ValueEnum};
use log::info;

#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// Concurrency strategy.
    #[arg(short, long, value_enum, default_value_t = Mode::Reactor)]
    mode: Mode,
    /// Transport to serve.
    #[arg(short, long, value_enum, default_value_t = TransportArg::Tcp)]
    transport: TransportArg,
    /// Address to bind, defaults to the well-known port of the mode.
    #[arg(short, long)]
    addr: Option<SocketAddr>,
    /// Server tag reported in every response.
    #[arg(long)]
    tag: Option<String>,
    /// Workers for the pooled mode, defaults to the number of CPUs.
    #[arg(long)]
    threads: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Iterative,
    Pooled,
    Reactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Tcp,
    Udp,
}

/// Well-known port and tag of each server variant.
fn defaults(mode: Mode, transport: TransportArg) -> (u16, &'static str) {
    match (mode, transport) {
        (Mode::Iterative, TransportArg::Tcp) => (9001, "iterative_tcp"),
        (Mode::Pooled, TransportArg::Tcp) => (9002, "concurrent_tcp_threads"),
        (Mode::Reactor, TransportArg::Tcp) => (9004, "concurrent_tcp_async"),
        (Mode::Iterative, TransportArg::Udp) => (9005, "iterative_udp"),
        (Mode::Pooled, TransportArg::Udp) => (9006, "concurrent_udp_threads"),
        (Mode::Reactor, TransportArg::Udp) => (9008, "concurrent_udp_async"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (port, tag) = defaults(args.mode, args.transport);
    let addr = args
        .addr
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    let service = Service::new(Calculator, args.tag.unwrap_or_else(|| tag.to_string()));
    let threads = args.threads.unwrap_or(num_cpus::get() as u32);
    info!(
        "CARGO_PKG_VERSION: {}, starting {:?} {:?} server on {}",
        env!("CARGO_PKG_VERSION"),
        args.mode,
        args.transport,
        addr
    );

    let bind_failed = || format!("cannot serve on {addr}");
    match (args.mode, args.transport) {
        (Mode::Reactor, TransportArg::Tcp) => StreamReactor::bind(addr, service)
            .with_context(bind_failed)?
            .run()?,
        (Mode::Reactor, TransportArg::Udp) => DatagramReactor::bind(addr, service)
            .with_context(bind_failed)?
            .run()?,
        (mode, TransportArg::Tcp) => StreamServer::bind(addr, service, concurrency(mode, threads))
            .with_context(bind_failed)?
            .run()?,
        (mode, TransportArg::Udp) => {
            DatagramServer::bind(addr, service, concurrency(mode, threads))
                .with_context(bind_failed)?
                .run()?
        }
    }
    Ok(())
}

fn concurrency(mode: Mode, threads: u32) -> Concurrency {
    match mode {
        Mode::Pooled => Concurrency::Pooled(threads),
        Mode::Iterative | Mode::Reactor => Concurrency::Iterative,
    }
}

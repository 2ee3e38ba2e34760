use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use reltcp::{Config, Interface, TeardownWatcher};

/// Open and tear down simplified-TCP connections over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Milliseconds before an unacknowledged SYN or FIN is resent.
    #[arg(long, global = true, default_value_t = 1000)]
    rto_ms: u64,

    /// Seconds spent in TIME_WAIT.
    #[arg(long, global = true, default_value_t = 30)]
    time_wait_secs: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections one after another on a port.
    Server {
        /// UDP address to bind.
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Port to accept connections on.
        #[arg(short, long, default_value_t = 80)]
        port: u16,
        /// Number of connections to accept.
        #[arg(short = 'n', long, default_value_t = 5)]
        count: u32,
        /// Seconds to hold each connection open before closing it.
        #[arg(long, default_value_t = 10)]
        hold: u64,
    },
    /// Open connections one after another to a server.
    Client {
        /// UDP address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        /// UDP address of the server's interface.
        #[arg(short, long)]
        server: SocketAddr,
        /// Port the server accepts on.
        #[arg(short, long, default_value_t = 80)]
        port: u16,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: u32,
        #[arg(long, default_value_t = 10)]
        hold: u64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config {
        retransmit_interval: Duration::from_millis(cli.rto_ms),
        time_wait: Duration::from_secs(cli.time_wait_secs),
        ..Config::default()
    };

    let bind = match &cli.mode {
        Mode::Server { bind, .. } | Mode::Client { bind, .. } => *bind,
    };
    let interface =
        Interface::bind(bind, config).with_context(|| format!("failed to bind {bind}"))?;

    let watchers = match cli.mode {
        Mode::Server {
            port, count, hold, ..
        } => serve(&interface, port, count, Duration::from_secs(hold))?,
        Mode::Client {
            server,
            port,
            count,
            hold,
            ..
        } => dial(&interface, server, port, count, Duration::from_secs(hold))?,
    };

    // the interface must outlive teardown: FINs, ACKs and retransmissions
    // still flow through its packet loop
    log::info!("waiting for {} connection(s) to finish closing", watchers.len());
    for w in watchers {
        let port = w.connection().local_port();
        w.join()
            .with_context(|| format!("teardown of connection on port {port}"))?;
    }
    Ok(())
}

fn serve(
    interface: &Interface,
    port: u16,
    count: u32,
    hold: Duration,
) -> anyhow::Result<Vec<TeardownWatcher>> {
    log::info!("accepting on port {port} via {}", interface.local_addr());

    let mut watchers = Vec::new();
    for _ in 0..count {
        let conn = interface
            .accept(port)
            .with_context(|| format!("accept on port {port}"))?;
        log::info!("got connection from {:?}", conn.remote());

        thread::sleep(hold);
        watchers.extend(conn.close().context("close")?);
    }
    Ok(watchers)
}

fn dial(
    interface: &Interface,
    server: SocketAddr,
    port: u16,
    count: u32,
    hold: Duration,
) -> anyhow::Result<Vec<TeardownWatcher>> {
    let mut watchers = Vec::new();
    for _ in 0..count {
        let conn = interface
            .connect(server, port)
            .with_context(|| format!("connect to {server} port {port}"))?;
        log::info!("got connection on local port {}", conn.local_port());

        thread::sleep(hold);
        watchers.extend(conn.close().context("close")?);
    }
    Ok(watchers)
}

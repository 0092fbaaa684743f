//! An FTP application-level gateway implemented in Rust
//!
//! Ftpgated is an FTP gateway built on the ftpgate crate.
//!
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::*;

use ftpgate as gate;

#[derive(Parser, Debug)]
#[command(name = "ftpgate")]
struct Opt {
    /// Set port to listen on
    #[arg(short = 'p', long = "port", default_value = "2121")]
    port: u16,

    /// Set ipaddress to listen on
    #[arg(short = 'i', long = "ip", default_value = "0.0.0.0")]
    ipaddr: IpAddr,

    /// Set address of the upstream FTP server
    #[arg(short = 'u', long = "upstream", default_value = "127.0.0.1:21")]
    upstream: SocketAddr,

    /// Set path to configuration file (format: yaml)
    #[arg(short = 'c', long = "config")]
    configfile: Option<PathBuf>,
}

fn set_handler(signals: &[i32], handler: impl Fn(i32) + Send + 'static) -> io::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new(signals)?;
    std::thread::spawn(move || signals.forever().for_each(handler));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use signal_hook::consts::*;
    env_logger::init();

    println!("ftpgated");
    let opt = Opt::parse();
    debug!("option: {:?}", opt);

    let config = match opt.configfile {
        Some(ref path) => gate::GatewayConfig::with_file(path)
            .with_context(|| format!("config file: {}", path.display()))?,
        None => gate::GatewayConfig::new(opt.ipaddr, opt.port, opt.upstream),
    };

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    set_handler(&[SIGTERM, SIGINT, SIGQUIT], move |sig| {
        info!("signal {} received, shutting down", sig);
        flag.store(false, Ordering::Relaxed);
    })
    .context("setting signal handler")?;

    let mut server = gate::Server::new(config).context("starting gateway")?;
    if let Err(err) = server.serve(running) {
        error!("server error: {:?}", err);
    }
    Ok(())
}

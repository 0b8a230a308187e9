use clap::Parser;
use color_eyre::{Result, eyre::eyre};
use futures_lite::AsyncReadExt as _;
use smol::net::TcpListener;
use xvcd_io::usb;

mod cli;
mod session;
mod xvc;

use cli::Args;
use session::{Config, Session};

fn main() -> std::process::ExitCode {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        return std::process::ExitCode::from(1);
    }
    std::process::ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            e.print()?;
            std::process::exit(2);
        }
    };
    init_logging(&args)?;
    smol::block_on(serve(args))
}

async fn serve(args: Args) -> Result<()> {
    let (vendor, products, serial): (u16, Vec<u16>, Option<String>) = match &args.device {
        Some(filter) => (filter.vendor, vec![filter.product], filter.serial.clone()),
        None => (usb::DEFAULT_VENDOR, usb::DEFAULT_PRODUCTS.to_vec(), None),
    };
    let interface = if args.second_interface {
        usb::Interface::B
    } else {
        usb::Interface::A
    };

    let config = Config {
        loopback: args.loopback,
        runt_diagnostics: args.runt_diagnostics,
        locked_clock_hz: args.clock.map(|f| f.0),
        statistics: args.statistics,
        gpio: args.gpio.map(|g| g.0).unwrap_or_default(),
        ..Config::default()
    };

    let listener = TcpListener::bind((args.addr, args.port))
        .await
        .map_err(|e| eyre!("failed to bind {}:{}: {e}", args.addr, args.port))?;
    if !args.quiet {
        tracing::info!(addr = %args.addr, port = args.port, "xvcd listening");
    }

    loop {
        let (mut stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "client connected");

        let handle = usb::find(vendor, &products, serial.as_deref()).await?;
        let usb_dev = usb::Device::open(handle, interface).await?;
        let mut session = Session::new(usb_dev, config.clone());
        session.apply_startup_state().await?;

        if let Err(err) = xvc::serve_connection(&mut stream, &mut session).await {
            tracing::warn!(%peer, error = %err, "connection ended");
        }
        if session.config.statistics {
            tracing::info!(%peer, stats = %session.stats, "connection statistics");
        }
        drain_remaining(&mut stream).await;
    }
}

/// Best-effort: let the client see the connection close cleanly rather than
/// an abrupt reset if it still has unread bytes queued.
async fn drain_remaining(stream: &mut smol::net::TcpStream) {
    let mut scratch = [0u8; 64];
    while matches!(stream.read(&mut scratch).await, Ok(n) if n > 0) {}
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let mut filter = if args.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::new("info")
    };
    if args.log_usb {
        filter = filter.add_directive("xvcd_io::usb=trace".parse()?);
    }
    if args.log_xvc {
        filter = filter.add_directive("xvcd_cli::xvc=trace".parse()?);
    }
    if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
        filter = filter.add_directive(env.parse()?);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .with(tracing_error::ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}

use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::{error, LevelFilter};

use udptunnel::relay::Session;
use udptunnel::tcp::acceptor;
use udptunnel::{activation, tcp, udp, ConfigError, Role, Transport, TunnelConfig};

/// Tunnel UDP datagrams over a TCP connection.
///
/// With --server, listen on SOURCE:PORT for TCP connections and relay
/// the encapsulated packets with UDP to DESTINATION:PORT. Otherwise
/// listen on SOURCE:PORT for UDP packets and encapsulate them in a TCP
/// connection to DESTINATION:PORT.
#[derive(Parser, Debug)]
#[command(name = "udptunnel", version)]
struct Args {
    /// Listen for TCP connections
    #[arg(short = 's', long)]
    server: bool,

    /// Expect to be started by inetd, with the socket on stdin
    #[arg(short = 'i', long)]
    inetd: bool,

    /// Close the source connection after SECS seconds without data
    #[arg(short = 'T', long, value_name = "SECS", default_value_t = 0)]
    timeout: u64,

    /// Explain what is being done (repeat for more detail)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Override the handshake token (at most 32 bytes, NUL-padded)
    #[arg(long, value_name = "TOKEN")]
    handshake: Option<String>,

    /// [SOURCE:]PORT DESTINATION:PORT; SOURCE:PORT must be omitted
    /// under inetd or socket activation
    #[arg(value_name = "ADDRESS", required = true, num_args = 1..=2)]
    addresses: Vec<String>,
}

/// Info by default: a session always reports why it ended, even in a
/// plain no-flags run.
fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn init_logging(verbose: u8) {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log_level(verbose))
        .init();
}

fn build_config(args: &Args) -> Result<TunnelConfig, ConfigError> {
    let role = if args.server { Role::Server } else { Role::Client };
    let transport = if args.inetd {
        Transport::Stdio
    } else if activation::activation_pending() {
        Transport::Inherited
    } else {
        Transport::Standalone
    };

    let expected = if transport == Transport::Standalone { 2 } else { 1 };
    if args.addresses.len() != expected {
        return Err(ConfigError::AddressCount { expected, got: args.addresses.len() });
    }

    let mut addresses = args.addresses.iter();
    let source = (expected == 2).then(|| addresses.next().unwrap().clone());
    let destination = addresses.next().unwrap().clone();

    let mut config = TunnelConfig::new(role, transport, destination);
    config.source = source;
    config.timeout_secs = args.timeout;
    if let Some(token) = &args.handshake {
        config.set_handshake(token.as_bytes())?;
    }
    Ok(config)
}

async fn run(config: TunnelConfig) -> Result<()> {
    let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));

    match config.role {
        Role::Server => match config.transport {
            Transport::Standalone => {
                let source = config.source.as_deref().context("missing source address")?;
                let listeners = tcp::tcp_listeners(source).await?;
                acceptor::serve(listeners, config.destination, config.handshake, timeout).await
            }
            Transport::Inherited => {
                let fds = activation::inherited_descriptors()
                    .context("socket activation descriptors are gone")?;
                let listeners = activation::tcp_listeners_from(fds)?;
                acceptor::serve(listeners, config.destination, config.handshake, timeout).await
            }
            Transport::Stdio => {
                // inetd hands us one established connection; serve it
                // and exit.
                let stream = activation::stdio_stream()?;
                let (udp_socket, udp_peer) = udp::udp_client(&config.destination).await?;
                let session =
                    Session::server(stream, udp_socket, udp_peer, config.handshake, timeout);
                session.run().await?;
                Ok(())
            }
        },
        Role::Client => {
            let udp_socket = match config.transport {
                Transport::Standalone => {
                    let source = config.source.as_deref().context("missing source address")?;
                    udp::udp_listener(source).await?
                }
                Transport::Inherited => {
                    let fds = activation::inherited_descriptors()
                        .context("socket activation descriptors are gone")?;
                    activation::udp_socket_from(fds)?
                }
                Transport::Stdio => activation::stdio_datagram()?,
            };

            let stream = tcp::tcp_client(&config.destination).await?;
            let mut session = Session::client(stream, udp_socket, timeout);
            session.send_handshake(&config.handshake).await?;
            session.run().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_end_lines_are_visible_without_flags() {
        // Orderly terminations log at info; the default filter must
        // let them through.
        assert!(LevelFilter::Info <= log_level(0));
    }

    #[test]
    fn verbosity_raises_the_filter_monotonically() {
        assert_eq!(log_level(0), LevelFilter::Info);
        assert_eq!(log_level(1), LevelFilter::Debug);
        assert_eq!(log_level(2), LevelFilter::Trace);
        assert_eq!(log_level(5), LevelFilter::Trace);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    };

    if let Err(e) = run(config).await {
        error!("{e:#}");
        let status = if e.downcast_ref::<ConfigError>().is_some() { 2 } else { 1 };
        process::exit(status);
    }
}

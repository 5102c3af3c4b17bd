use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use revtun::client::Client;
use revtun::config::ClientConfig;
use revtun::protocol::{CONTROL_PORT, DEFAULT_MAX_TUNNEL_PORT, DEFAULT_MIN_TUNNEL_PORT};
use revtun::server::Server;
use revtun::transport::Kind;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts a local proxy to a remote server, exposing a local port.
    Local {
        /// The local port to expose.
        #[clap(env = "HERMES_LOCAL_PORT")]
        local_port: u16,

        /// The local host to expose.
        #[clap(short = 'H', long, value_name = "HOST", default_value = "localhost")]
        local_host: String,

        /// Address of the remote server to expose local ports through.
        /// Falls back to the saved config's host if omitted.
        #[clap(short, long, env = "HERMES_SERVER")]
        to: Option<String>,

        /// Server control port. Falls back to the saved config's port if
        /// omitted, then to the protocol default.
        #[clap(long, env = "HERMES_PORT")]
        port: Option<u16>,

        /// Requested public port on the server; 0 picks a random port.
        #[clap(short, long, default_value_t = 0)]
        remote_port: u16,

        /// Use TLS for the control connection and every tunnel dial-back.
        #[clap(long)]
        tls: bool,

        /// Validate the server's TLS certificate against system roots.
        /// Disable only against a self-signed development server.
        #[clap(long, requires = "tls", default_value_t = true)]
        tls_verify: bool,

        /// Pre-shared password.
        #[clap(long, env = "HERMES_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Reconnect with a fixed backoff instead of exiting on disconnect.
        #[clap(long)]
        restart: bool,

        /// Persist --to/--port/--tls as defaults in $HOME/.hermes/config.json.
        #[clap(long)]
        save: bool,

        /// Log verbosity, e.g. error, warn, info, debug, trace.
        #[clap(long, default_value = "info")]
        log_level: String,
    },

    /// Runs the server that clients tunnel through.
    Serve {
        /// Plaintext control port.
        #[clap(long, default_value_t = CONTROL_PORT, env = "HERMES_PORT")]
        port: u16,

        /// TLS control port. Omit to disable TLS control connections.
        #[clap(long)]
        tls_port: Option<u16>,

        /// PEM certificate chain, required when --tls-port is set.
        #[clap(long, requires = "tls_port")]
        tls_cert: Option<PathBuf>,

        /// PEM private key, required when --tls-port is set.
        #[clap(long, requires = "tls_port")]
        tls_key: Option<PathBuf>,

        /// Lower bound (inclusive) of the tunnel-port pool.
        #[clap(long, default_value_t = DEFAULT_MIN_TUNNEL_PORT, env = "HERMES_MIN_TUNNEL_PORT")]
        min_tunnel_port: u16,

        /// Upper bound (exclusive) of the tunnel-port pool.
        #[clap(long, default_value_t = DEFAULT_MAX_TUNNEL_PORT, env = "HERMES_MAX_TUNNEL_PORT")]
        max_tunnel_port: u16,

        /// Pre-shared password; omit to allow any client.
        #[clap(long, env = "HERMES_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// IP address to bind to, clients and visitors must be able to reach it.
        #[clap(long, default_value = "0.0.0.0")]
        bind_addr: IpAddr,

        /// Log verbosity, e.g. error, warn, info, debug, trace.
        #[clap(long, default_value = "info")]
        log_level: String,
    },
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Local {
            local_host,
            local_port,
            to,
            port,
            remote_port,
            tls,
            tls_verify,
            password,
            restart,
            save,
            log_level,
        } => {
            init_tracing(&log_level);

            let saved = ClientConfig::load()?;
            let server_host = to.unwrap_or(saved.host);
            let server_port = port.unwrap_or(saved.port);
            let tls = tls || saved.tls;

            if save {
                ClientConfig {
                    host: server_host.clone(),
                    port: server_port,
                    tls,
                }
                .save()?;
            }

            let remote_port = if remote_port == 0 {
                revtun::client::pick_remote_port(server_port)
            } else {
                remote_port
            };

            let client = Client {
                local_host,
                local_port,
                server_host,
                server_port,
                remote_port,
                kind: if tls { Kind::Tls } else { Kind::Plain },
                tls_verify,
                password: password.unwrap_or_default(),
                restart,
            };
            client.run().await?;
        }
        Command::Serve {
            port,
            tls_port,
            tls_cert,
            tls_key,
            min_tunnel_port,
            max_tunnel_port,
            password,
            bind_addr,
            log_level,
        } => {
            init_tracing(&log_level);

            if min_tunnel_port >= max_tunnel_port {
                anyhow::bail!("--min-tunnel-port must be less than --max-tunnel-port");
            }
            if (4001..14001).contains(&min_tunnel_port) || (4001..14001).contains(&max_tunnel_port)
            {
                tracing::warn!(
                    "tunnel-port pool overlaps the client's default remote-port range [4001, 14001)"
                );
            }

            let server = Server {
                bind_addr,
                control_port: Some(port),
                control_tls_port: tls_port,
                tls_cert,
                tls_key,
                password: password.unwrap_or_default(),
                min_port: min_tunnel_port,
                max_port: max_tunnel_port,
            };
            server.listen().await?;
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Args::parse().command).await
}

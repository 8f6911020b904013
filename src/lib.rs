#![allow(clippy::too_many_arguments)]

use {
    anyhow::{Context, Error},
    clap::{
        Parser, Subcommand,
        builder::styling::{AnsiColor, Effects, Styles},
    },
    std::{process, time::Duration},
    stratum::Username,
    tokio_util::sync::CancellationToken,
    tracing::error,
    tracing_subscriber::EnvFilter,
};

pub mod generator;

pub use generator::{
    NotifyInstance, NotifyRegistry, OutboundMsg, ProxyConfig, ProxyInstance, RpcEndpoint,
    ServerConfig, ShareMsg, ShareRegistry, SessionState, Signal, UpstreamConfig, run_proxy,
    run_server,
};

type Result<T = (), E = Error> = std::result::Result<T, E>;

#[derive(Debug, Parser)]
#[command(
  version,
  about = "Upstream-facing generator for a stratum mining pool",
  styles = Styles::styled()
    .error(AnsiColor::Red.on_default() | Effects::BOLD)
    .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .invalid(AnsiColor::Red.on_default())
    .literal(AnsiColor::Blue.on_default())
    .placeholder(AnsiColor::Cyan.on_default())
    .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .valid(AnsiColor::Green.on_default()),
)]
struct Arguments {
    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bridge a stratifier to an upstream stratum pool.
    Proxy(ProxyArgs),
    /// Bridge a stratifier to one or more bitcoin RPC endpoints.
    Server(ServerArgs),
}

#[derive(Debug, Parser)]
struct ProxyArgs {
    #[arg(required = true, help = "Upstream stratum pool <HOST:PORT>, tried in order at startup.")]
    upstream: Vec<String>,

    #[arg(long, help = "Username/address for upstream authentication.")]
    username: String,

    #[arg(long, help = "Password for upstream authentication.")]
    password: Option<String>,

    #[arg(long, default_value = "0.0.0.0", help = "Listen address for the stratifier request endpoint.")]
    address: String,

    #[arg(long, default_value_t = 3333, help = "Listen port for the stratifier request endpoint.")]
    port: u16,

    #[arg(long, default_value_t = 10, help = "Upstream connect timeout in seconds.")]
    timeout: u64,
}

#[derive(Debug, Parser)]
struct ServerArgs {
    #[arg(required = true, help = "Bitcoin RPC endpoint <URL>, tried in order at startup.")]
    rpc_url: Vec<String>,

    #[arg(long, help = "RPC username, shared by every configured endpoint.")]
    rpc_user: String,

    #[arg(long, help = "RPC password, shared by every configured endpoint.")]
    rpc_password: String,

    #[arg(long, default_value = "0.0.0.0", help = "Listen address for the stratifier request endpoint.")]
    address: String,

    #[arg(long, default_value_t = 3334, help = "Listen port for the stratifier request endpoint.")]
    port: u16,

    #[arg(long, default_value_t = 30, help = "RPC call timeout in seconds.")]
    timeout: u64,
}

impl Arguments {
    async fn run(self, cancel: CancellationToken) -> Result {
        match self.subcommand {
            Command::Proxy(args) => {
                generator::run_proxy(
                    ProxyConfig {
                        upstreams: args.upstream,
                        upstream: UpstreamConfig {
                            auth: Username::new(args.username),
                            pass: args.password,
                            client_version: generator::USER_AGENT.to_string(),
                            timeout: Duration::from_secs(args.timeout),
                        },
                        listen_address: args.address,
                        listen_port: args.port,
                    },
                    cancel,
                )
                .await
                .context("proxy mode failed")
            }
            Command::Server(args) => {
                let endpoints = args
                    .rpc_url
                    .into_iter()
                    .map(|url| RpcEndpoint {
                        url,
                        user: args.rpc_user.clone(),
                        pass: args.rpc_password.clone(),
                    })
                    .collect();

                generator::run_server(
                    ServerConfig {
                        endpoints,
                        listen_address: args.address,
                        listen_port: args.port,
                        rpc_timeout: Duration::from_secs(args.timeout),
                    },
                    cancel,
                )
                .await
                .context("server mode failed")
            }
        }
    }
}

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();
    let cancel = CancellationToken::new();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start tokio runtime: {err}");
            process::exit(1);
        }
    };

    let ctrl_c_cancel = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    match runtime.block_on(args.run(cancel)) {
        Err(err) => {
            error!("error: {err:#}");
            process::exit(1);
        }
        Ok(()) => {
            process::exit(0);
        }
    }
}

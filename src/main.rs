// netbridge - runc hook for setting up default bridge networking.
//
// Invoked without a subcommand it acts as the hook: reads the OCI state
// from stdin, provisions the endpoint and writes the assigned address to
// the ip file for downstream hooks.

use std::io::Read;

use clap::{Parser, Subcommand};

use netbridge::bridge::{BridgeSpec, DEFAULT_MTU};
use netbridge::client::{Client, HookState, Opt};
use netbridge::error::{NetworkError, Result};

const DEFAULT_BRIDGE_NAME: &str = "netbridge0";
const DEFAULT_BRIDGE_IP: &str = "172.19.0.1/16";
const DEFAULT_STATE_DIR: &str = "/run/netbridge";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runc hook for setting up default bridge networking")]
#[clap(propagate_version = true)]
struct Cli {
    /// File in which to save the container's ip address
    #[clap(long, global = true, default_value = ".ip")]
    ipfile: String,

    /// Name of the interface in the namespace
    #[clap(long, global = true, default_value = netbridge::client::DEFAULT_CONTAINER_INTERFACE)]
    iface: String,

    /// Directory for saving state, used for ip allocation
    #[clap(long, global = true, default_value = DEFAULT_STATE_DIR)]
    state_dir: String,

    /// Name for the bridge
    #[clap(long, global = true, default_value = DEFAULT_BRIDGE_NAME)]
    bridge: String,

    /// IP address for the bridge
    #[clap(long, global = true, default_value = DEFAULT_BRIDGE_IP)]
    ip: String,

    /// MTU for the bridge
    #[clap(long, global = true, default_value_t = DEFAULT_MTU)]
    mtu: u32,

    /// Use a static IP address instead of allocating one
    #[clap(long, global = true, default_value = "")]
    static_ip: String,

    /// Enable debug logging
    #[clap(short = 'd', long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision an endpoint for the hooked process (the default)
    Create,
    /// List recorded endpoints
    Ls,
    /// Delete the bridge
    Rm,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("netbridge: {}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new(Opt {
        state_dir: cli.state_dir.clone(),
        container_interface: cli.iface.clone(),
        port_prefix: String::new(),
        bridge_name: cli.bridge.clone(),
    })?;

    let bridge_spec = BridgeSpec {
        name: cli.bridge.clone(),
        ip_addr: cli.ip.clone(),
        mtu: cli.mtu,
    };

    match cli.command {
        None | Some(Commands::Create) => {
            let hook = read_hook_state()?;
            let static_ip = if cli.static_ip.is_empty() {
                None
            } else {
                Some(cli.static_ip.as_str())
            };

            let ip = client.create(&hook, &bridge_spec, static_ip).await?;

            // Save the ip to a file so other hooks can use it.
            if let Err(e) = std::fs::write(&cli.ipfile, ip.to_string()) {
                tracing::error!(
                    "saving allocated ip address for container to {} failed",
                    cli.ipfile
                );
                return Err(NetworkError::Io(e));
            }
        }
        Some(Commands::Ls) => {
            let endpoints = client.list().await?;

            println!("{:<18} {:<8} {:<16} VETH", "IP", "PID", "STATUS");
            for ep in endpoints {
                println!(
                    "{:<18} {:<8} {:<16} {}",
                    ep.ip, ep.pid, ep.status, ep.host_veth
                );
            }
        }
        Some(Commands::Rm) => {
            client.destroy().await?;
            println!("bridge {} deleted", cli.bridge);
        }
    }

    Ok(())
}

/// Decode stdin as the OCI hook state.
fn read_hook_state() -> Result<HookState> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .map_err(NetworkError::Io)?;

    let hook: HookState = serde_json::from_str(&raw).map_err(|e| {
        NetworkError::BadOption(format!("unmarshaling stdin as hook state failed: {}", e))
    })?;

    tracing::debug!("hook state: {:?}", hook);
    Ok(hook)
}

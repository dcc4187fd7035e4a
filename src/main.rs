use std::env;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use swim_membership::network::{local_ipv4, start_udp_server, UdpNetworkClient};
use swim_membership::{Member, MemberId, MemberState, MembershipService, SwimConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            eprintln!("swim-membership: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config_from_env()?;
    let local_ip = local_ipv4().context("discover local IPv4 address")?;
    let mut state = MemberState::ALIVE;
    if config.is_introducer() {
        state = state | MemberState::INTRODUCER | MemberState::MONITOR;
    }
    let myself = Member::new(MemberId::starting_now(local_ip), state);
    log::info!("Starting member {} on port {}", myself.id, config.port);

    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await
        .with_context(|| format!("bind UDP port {}", config.port))?);
    let (sender, receiver) = mpsc::unbounded_channel();
    let service_token = tokio_util::sync::CancellationToken::new();
    let network_client = UdpNetworkClient::spawn(socket.clone(), service_token.clone());
    let server = tokio::spawn(start_udp_server(service_token.clone(), socket, sender, config.max_datagram_size));

    let probe_period = config.probe_period;
    let service = MembershipService::new(config, myself, Box::new(network_client));
    let handles = service.start(receiver);
    service.join().await.context("join failed")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    log::info!("Leaving cluster");
    service.leave()?;
    tokio::time::sleep(probe_period * 4).await;

    service.shutdown();
    service_token.cancel();
    for handle in handles {
        handle.await?;
    }
    server.await??;
    Ok(())
}

fn config_from_env() -> anyhow::Result<SwimConfig> {
    let mut config = SwimConfig::default();
    if let Ok(port) = env::var("SWIM_PORT") {
        config.port = port.parse().with_context(|| format!("invalid SWIM_PORT {:?}", port))?;
    }
    if let Ok(introducer) = env::var("SWIM_INTRODUCER") {
        let address = match introducer.parse::<SocketAddr>() {
            Ok(address) => address,
            Err(_) => {
                let ip: IpAddr = introducer.parse()
                    .with_context(|| format!("invalid SWIM_INTRODUCER {:?}", introducer))?;
                SocketAddr::new(ip, config.port)
            }
        };
        config.introducer = Some(address);
    }
    Ok(config)
}

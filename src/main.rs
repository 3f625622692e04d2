use std::env;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use yakphone::config::Config;
use yakphone::infrastructure::protocols::sip::{
    StaticSessionFactory, SystemResolver, UdpTransport, UserAgent,
};
use yakphone::{ClientEvent, ClientState};

/// Usage: yakphone [config-file] [recipient]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting YakPhone");

    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "yakphone.toml".to_string());
    let recipient = args.next();

    let config = Config::load(&config_path)?;
    info!("Account {}", config.identity().address_of_record());

    let bind_address = config.bind_address()?;
    let transport = loop {
        match UdpTransport::bind(bind_address).await {
            Ok(transport) => break transport,
            Err(e) => {
                warn!("{}, retrying in {}s", e, config.timers.connect_retry_secs);
                tokio::time::sleep(Duration::from_secs(config.timers.connect_retry_secs)).await;
            }
        }
    };
    let resolver = SystemResolver::new()?;
    let factory = StaticSessionFactory::new(config.media.rtp_port);
    let (agent, handle) = UserAgent::new(config.client_config(), transport, resolver, Box::new(factory));

    let mut events = handle.subscribe();
    let agent_task = tokio::spawn(agent.run());
    handle.connect().await?;

    let mut dialed = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Event stream: {}", e);
                        continue;
                    }
                };
                info!("{}", serde_json::to_string(&event)?);

                match &event {
                    ClientEvent::StateChanged { state: ClientState::Connected } if !dialed => {
                        dialed = true;
                        if let Some(recipient) = &recipient {
                            match handle.call(recipient).await {
                                Ok(call_id) => info!("Dialing {} as {}", recipient, call_id),
                                Err(e) => error!("Cannot call {}: {}", recipient, e),
                            }
                        }
                    }
                    ClientEvent::CallReceived { call_id, from } => {
                        info!("Answering call from {}", from);
                        if let Err(e) = handle.accept(call_id).await {
                            error!("Cannot answer {}: {}", call_id, e);
                        }
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, unregistering");
                handle.disconnect().await?;
                break;
            }
        }
    }

    // give the un-REGISTER a chance to complete
    let unregistered = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(event) = events.recv().await {
            if let ClientEvent::StateChanged { state: ClientState::Disconnected } = event {
                break;
            }
        }
    })
    .await;
    if unregistered.is_err() {
        warn!("Unregistration did not finish in time");
    }

    handle.shutdown().await?;
    agent_task.await??;
    Ok(())
}

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use call_negotiator::rtc::{self, RtcEngineFactory};
use call_negotiator::{CallConfig, CallEvent, CallId, CallManager, DialOptions};
use clap::Parser;
use signal_relay::LocalRelay;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::Cli;

struct Party {
    name: String,
    manager: CallManager,
    events: mpsc::UnboundedReceiver<(CallId, CallEvent)>,
}

impl Party {
    fn join(relay: &Arc<LocalRelay>, factory: Arc<RtcEngineFactory>, config: CallConfig) -> Result<Self> {
        let name = config.local_peer_id.clone();
        let inbound = relay.attach(&name);
        let manager = CallManager::new(config, factory, relay.clone())?;
        manager.on_error(|id, err| warn!(target = "call_demo", call_id = %id, error = %err, "call error"));
        let events = manager.subscribe();
        manager.gateway().spawn_pump(inbound);
        Ok(Self {
            name,
            manager,
            events,
        })
    }

    async fn wait_for(&mut self, id: &CallId, name: &str) -> Result<CallEvent> {
        while let Some((call, event)) = self.events.recv().await {
            if &call != id {
                continue;
            }
            println!("[{}] {}", self.name, event.name());
            if let CallEvent::Error(err) = &event {
                return Err(anyhow!("call {call} failed: {err}"));
            }
            if event.name() == name {
                return Ok(event);
            }
            if matches!(event, CallEvent::Disconnected) {
                return Err(anyhow!("call {call} disconnected while waiting for {name}"));
            }
        }
        Err(anyhow!("event stream closed"))
    }
}

fn config_for(peer: &str, localhost_only: bool) -> Result<CallConfig> {
    let mut builder = CallConfig::builder().local_peer_id(peer);
    if localhost_only {
        builder = builder.localhost_only();
    }
    Ok(builder.build()?)
}

async fn run(cli: Cli) -> Result<()> {
    let relay = LocalRelay::new();
    let factory = Arc::new(RtcEngineFactory::new().context("initialise webrtc")?);
    let mut caller = Party::join(&relay, factory.clone(), config_for(&cli.caller, cli.localhost_only)?)?;
    let mut callee = Party::join(&relay, factory, config_for(&cli.callee, cli.localhost_only)?)?;

    let id = caller
        .manager
        .dial(&cli.callee, DialOptions::new().channel(cli.channel.clone()))?;
    info!(target = "call_demo", call_id = %id, "dialed {}", cli.callee);

    callee.wait_for(&id, "incoming-call").await?;
    callee.wait_for(&id, "channel-open").await?;
    caller.wait_for(&id, "channel-open").await?;

    let inbound = callee
        .manager
        .data_channel(&id, &cli.channel)
        .await?
        .and_then(|handle| rtc::data_channel(&handle))
        .ok_or_else(|| anyhow!("callee has no {} channel", cli.channel))?;
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    inbound.on_message(Box::new(move |msg| {
        let _ = received_tx.send(String::from_utf8_lossy(&msg.data).into_owned());
        Box::pin(async {})
    }));

    let outbound = caller
        .manager
        .data_channel(&id, &cli.channel)
        .await?
        .and_then(|handle| rtc::data_channel(&handle))
        .ok_or_else(|| anyhow!("caller has no {} channel", cli.channel))?;
    outbound
        .send_text(cli.message.clone())
        .await
        .context("send message")?;

    let received = received_rx
        .recv()
        .await
        .ok_or_else(|| anyhow!("channel closed before the message arrived"))?;
    println!("{} -> {}: {received}", cli.caller, cli.callee);

    caller.manager.close(&id).await?;
    callee.manager.remote_closed(&id).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    let timeout = Duration::from_secs(cli.timeout_secs);
    tokio::time::timeout(timeout, run(cli))
        .await
        .map_err(|_| anyhow!("call did not complete within {timeout:?}"))?
}

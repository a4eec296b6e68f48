use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use smol_str::SmolStr;
use softsip_agent::{
    ClientConfig, ClientState, DnsResolver, SipClient, SipClientEvent, StaticMediaFactory,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line SIP softphone: registers, dials, and answers calls.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// SIP account user name
    #[arg(long)]
    username: String,
    /// SIP account password
    #[arg(long)]
    password: String,
    /// SIP domain to register against
    #[arg(long)]
    domain: String,
    /// Display name placed in From headers
    #[arg(long, default_value = "")]
    display_name: String,
    /// Address to dial once registered, e.g. sip:echo@example.com
    #[arg(long)]
    dial: Option<String>,
    /// Answer incoming calls instead of rejecting them
    #[arg(long)]
    auto_accept: bool,
    /// Host address advertised for RTP media
    #[arg(long, default_value = "127.0.0.1")]
    media_host: IpAddr,
    /// First RTP port advertised in SDP offers
    #[arg(long, default_value_t = 40000)]
    rtp_port: u16,
    /// Address probed to pick the local interface; nothing is sent to it
    #[arg(long, default_value = "8.8.8.8:53")]
    probe_address: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::new(&args.username, &args.password, &args.domain);
    config.display_name = SmolStr::new(&args.display_name);
    config.probe_address = args.probe_address;

    let media = StaticMediaFactory::new(args.media_host, args.rtp_port);
    let resolver = Arc::new(DnsResolver::new()?);
    let mut client = SipClient::bind(config, Box::new(media), resolver).await?;
    client.connect();

    let mut dial = args.dial.clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                client.disconnect();
            }
            event = client.next_event() => {
                let Some(event) = event else { break };
                match event {
                    SipClientEvent::ClientStateChanged(state) => {
                        info!("client state: {:?}", state);
                        match state {
                            ClientState::Connected => {
                                if let Some(recipient) = dial.take() {
                                    match client.call(&recipient).await {
                                        Some(call) => info!("dialing {} as call {}", recipient, call),
                                        None => warn!("could not dial {}", recipient),
                                    }
                                }
                            }
                            ClientState::Disconnected => break,
                            _ => {}
                        }
                    }
                    SipClientEvent::CallReceived { call, from } => {
                        info!("incoming call {} from {}", call, from);
                        if args.auto_accept {
                            client.accept(&call);
                        } else {
                            client.hangup(&call);
                        }
                    }
                    SipClientEvent::CallRinging { call } => info!("call {} is ringing", call),
                    SipClientEvent::CallStateChanged { call, state, error } => match error {
                        Some(error) => warn!("call {} now {:?}: {}", call, state, error),
                        None => info!("call {} now {:?}", call, state),
                    },
                    SipClientEvent::CallDuration { call, seconds } => {
                        if seconds % 10 == 0 {
                            info!("call {} up for {} seconds", call, seconds);
                        }
                    }
                    SipClientEvent::ActiveCallsChanged(count) => {
                        info!("{} active call(s)", count);
                    }
                }
            }
        }
    }
    client.shutdown();
    Ok(())
}

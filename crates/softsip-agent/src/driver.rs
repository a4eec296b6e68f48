//! Async driver wrapping [`ClientEngine`] behind a command channel.
//!
//! One task owns the UDP socket, the timer wheel, and the engine. Commands
//! arrive over an mpsc channel, datagrams over the socket, expirations from
//! a [`DelayQueue`], and resolver answers from spawned lookup tasks; every
//! stimulus is funneled through [`ClientEngine::handle`] and the resulting
//! actions are carried out in order.

use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::warn;

use crate::dns::SrvResolver;
use crate::engine::{Action, ClientConfig, ClientEngine, Input, Timer};
use crate::events::{CallId, SipClientEvent};
use crate::media::MediaFactory;

enum Command {
    Connect,
    Disconnect,
    Dial {
        recipient: SmolStr,
        reply: oneshot::Sender<Option<CallId>>,
    },
    Accept(CallId),
    Hangup(CallId),
}

/// Handle to a running SIP client task.
pub struct SipClient {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<SipClientEvent>,
    task: JoinHandle<()>,
}

impl SipClient {
    /// Binds a UDP socket and spawns the client task.
    pub async fn bind(
        config: ClientConfig,
        media_factory: Box<dyn MediaFactory>,
        resolver: Arc<dyn SrvResolver>,
    ) -> Result<SipClient> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding SIP socket")?;
        let local_port = socket.local_addr().context("reading local address")?.port();
        let probe_address = config.probe_address;
        let local_address = discover_local_address(probe_address)
            .await
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let mut engine = ClientEngine::new(config, media_factory, local_address, local_port);
        let gathering_tx = input_tx.clone();
        engine.set_gathering_sink(Arc::new(move |call| {
            let _ = gathering_tx.send(Input::GatheringComplete { call });
        }));

        let driver = Driver {
            engine,
            socket,
            resolver,
            probe_address,
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            input_tx,
            input_rx,
            events: event_tx,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Ok(SipClient {
            commands: command_tx,
            events: event_rx,
            task,
        })
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Dials `recipient` and returns the new call's id, or `None` when the
    /// client is not connected or the address does not parse.
    pub async fn call(&self, recipient: &str) -> Option<CallId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Dial {
                recipient: SmolStr::new(recipient),
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    pub fn accept(&self, call: &CallId) {
        let _ = self.commands.send(Command::Accept(call.clone()));
    }

    pub fn hangup(&self, call: &CallId) {
        let _ = self.commands.send(Command::Hangup(call.clone()));
    }

    /// Next engine event; `None` once the client task has gone away.
    pub async fn next_event(&mut self) -> Option<SipClientEvent> {
        self.events.recv().await
    }

    /// Tears the client task down without saying goodbye to the server.
    /// Use `disconnect` first for a clean un-register.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

struct Driver {
    engine: ClientEngine,
    socket: UdpSocket,
    resolver: Arc<dyn SrvResolver>,
    probe_address: SocketAddr,
    timers: DelayQueue<Timer>,
    timer_keys: HashMap<Timer, delay_queue::Key>,
    input_tx: mpsc::UnboundedSender<Input>,
    input_rx: mpsc::UnboundedReceiver<Input>,
    events: mpsc::UnboundedSender<SipClientEvent>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let actions = match command {
                        Command::Connect => self.engine.connect(),
                        Command::Disconnect => self.engine.disconnect(),
                        Command::Dial { recipient, reply } => {
                            let (id, actions) = self.engine.call(&recipient);
                            let _ = reply.send(id);
                            actions
                        }
                        Command::Accept(call) => self.engine.accept(&call),
                        Command::Hangup(call) => self.engine.hangup(&call),
                    };
                    self.apply(actions).await;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => {
                            let payload = Bytes::copy_from_slice(&buf[..len]);
                            let actions = self.engine.handle(Input::Datagram { payload, source });
                            self.apply(actions).await;
                        }
                        Err(err) => warn!("receiving datagram failed: {}", err),
                    }
                }
                expired = poll_fn(|cx| self.timers.poll_expired(cx)), if !self.timers.is_empty() => {
                    if let Some(expired) = expired {
                        let timer = expired.into_inner();
                        self.timer_keys.remove(&timer);
                        let actions = self.engine.handle(Input::Timer(timer));
                        self.apply(actions).await;
                    }
                }
                input = self.input_rx.recv() => {
                    if let Some(input) = input {
                        let actions = self.engine.handle(input);
                        self.apply(actions).await;
                    }
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { payload, to } => {
                    if let Err(err) = self.socket.send_to(&payload, to).await {
                        warn!("sending datagram to {} failed: {}", to, err);
                    }
                }
                Action::Start { timer, after } => {
                    if let Some(key) = self.timer_keys.remove(&timer) {
                        self.timers.remove(&key);
                    }
                    let key = self.timers.insert(timer.clone(), after);
                    self.timer_keys.insert(timer, key);
                }
                Action::Stop(timer) => {
                    if let Some(key) = self.timer_keys.remove(&timer) {
                        self.timers.remove(&key);
                    }
                }
                Action::ResolveSrv { service, name } => {
                    let resolver = Arc::clone(&self.resolver);
                    let tx = self.input_tx.clone();
                    tokio::spawn(async move {
                        let targets = resolver.lookup_srv(&name).await;
                        let _ = tx.send(Input::SrvResolved { service, targets });
                    });
                }
                Action::ResolveHost { service, name } => {
                    let resolver = Arc::clone(&self.resolver);
                    let tx = self.input_tx.clone();
                    tokio::spawn(async move {
                        let address = resolver.lookup_host(&name).await;
                        let _ = tx.send(Input::HostResolved { service, address });
                    });
                }
                Action::RefreshLocalAddress => {
                    let tx = self.input_tx.clone();
                    let probe = self.probe_address;
                    tokio::spawn(async move {
                        match discover_local_address(probe).await {
                            Ok(address) => {
                                let _ = tx.send(Input::LocalAddressRefreshed(address));
                            }
                            Err(err) => warn!("local address discovery failed: {}", err),
                        }
                    });
                }
                Action::Emit(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

/// Finds the interface address the OS would route traffic towards `probe`
/// through. Connecting a UDP socket selects a route without sending
/// anything; the probe address comes from [`ClientConfig::probe_address`].
async fn discover_local_address(probe: SocketAddr) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(probe).await?;
    Ok(socket.local_addr()?.ip())
}

/// Server core: configuration, the nickname registry, the shared command
/// intake, and the dispatcher that routes commands to handlers.
///
/// Clients own their connections; the server owns the shared maps and the
/// single dispatch loop that serializes all cross-client mutation.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::client::{Client, Phase, UserMode};
use super::command::{Command, CommandKind};
use super::reply;

/// Server tunables. Defaults match a small production deployment; tests
/// shrink the timeouts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name used as the prefix of numerics and server-originated lines.
    pub server_name: String,
    /// Phase new connections start in.
    pub init_phase: Phase,
    /// How long an unregistered connection may sit before it is dropped.
    pub login_timeout: Duration,
    /// Silence interval after which the server pings the client.
    pub idle_timeout: Duration,
    /// Grace period after the idle ping before the connection is dropped.
    pub quit_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            init_phase: Phase::Registration,
            login_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(180),
            quit_timeout: Duration::from_secs(60),
        }
    }
}

fn default_server_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "driftwood.local".to_owned())
}

/// One pending hostname resolution, handed from a client's read pump to the
/// server-wide resolver task.
#[derive(Debug)]
pub struct HostnameLookup {
    pub client: Arc<Client>,
    pub addr: String,
}

/// Nickname-to-client map. Insertion refuses an occupied key, so two live
/// clients can never share a nickname; removal is identity-checked so a
/// stale caller can never evict somebody else's entry.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    by_nick: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientRegistry {
    /// Insert under the client's current nickname. Returns false if the
    /// nickname is already held by another client.
    pub fn add(&self, client: Arc<Client>) -> bool {
        let mut map = self.by_nick.lock().unwrap();
        match map.entry(client.nick()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(client);
                true
            }
        }
    }

    /// Remove the client's entry, but only if the key still maps to this
    /// exact client.
    pub fn remove(&self, client: &Client) {
        let mut map = self.by_nick.lock().unwrap();
        let nick = client.nick();
        if map.get(&nick).is_some_and(|held| held.id() == client.id()) {
            map.remove(&nick);
        }
    }

    pub fn get(&self, nick: &str) -> Option<Arc<Client>> {
        self.by_nick.lock().unwrap().get(nick).cloned()
    }

    pub fn contains(&self, nick: &str) -> bool {
        self.by_nick.lock().unwrap().contains_key(nick)
    }

    pub fn len(&self) -> usize {
        self.by_nick.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_nick.lock().unwrap().is_empty()
    }
}

/// Cloneable handle to the server's shared state and intake queues. Every
/// client carries one.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub config: Arc<Config>,
    pub registry: Arc<ClientRegistry>,
    pub commands: mpsc::UnboundedSender<Command>,
    pub hostnames: mpsc::UnboundedSender<HostnameLookup>,
}

pub struct Server {
    handle: ServerHandle,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    hostnames_rx: mpsc::UnboundedReceiver<HostnameLookup>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (hostnames, hostnames_rx) = mpsc::unbounded_channel();
        Self {
            handle: ServerHandle {
                config: Arc::new(config),
                registry: Arc::new(ClientRegistry::default()),
                commands,
                hostnames,
            },
            commands_rx,
            hostnames_rx,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Start the dispatcher and the hostname resolver; returns the handle
    /// used to attach listeners and clients.
    pub fn spawn(self) -> ServerHandle {
        let handle = self.handle.clone();

        tokio::spawn(resolve_hostnames(self.hostnames_rx));
        tokio::spawn(async move {
            let mut dispatcher = Dispatcher {
                handle: self.handle,
                channels: HashMap::new(),
            };
            let mut commands = self.commands_rx;
            while let Some(cmd) = commands.recv().await {
                dispatcher.dispatch(cmd).await;
            }
        });

        handle
    }
}

/// Bind a listener and start accepting connections. Returns the bound
/// address (useful when binding to port 0).
pub async fn listen(handle: &ServerHandle, addr: &str) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "listening");

    let handle = handle.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    Client::new(handle.clone(), Box::new(stream), peer.to_string());
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }
    });

    Ok(local)
}

/// Spawn the server, bind every address, and serve until the process ends.
pub async fn run(config: Config, addrs: &[String]) -> io::Result<()> {
    let handle = Server::new(config).spawn();
    for addr in addrs {
        listen(&handle, addr).await?;
    }
    std::future::pending().await
}

/// Resolver task: answers each lookup with the canonical host for the
/// peer's address and writes it back onto the client.
async fn resolve_hostnames(mut lookups: mpsc::UnboundedReceiver<HostnameLookup>) {
    while let Some(HostnameLookup { client, addr }) = lookups.recv().await {
        let hostname = canonical_host(&addr);
        debug!(client = %client, hostname, "hostname resolved");
        client.set_hostname(hostname);
    }
}

/// Strip the port from a `host:port` peer address; pass anything else
/// through untouched.
fn canonical_host(addr: &str) -> String {
    match addr.parse::<SocketAddr>() {
        Ok(sock) => sock.ip().to_string(),
        Err(_) => addr.to_owned(),
    }
}

/// The single consumer of the command intake. Owns the channel map, so
/// channel creation and lookup need no locking.
struct Dispatcher {
    handle: ServerHandle,
    channels: HashMap<String, Arc<Channel>>,
}

impl Dispatcher {
    async fn dispatch(&mut self, cmd: Command) {
        let Some(client) = cmd.client().cloned() else {
            warn!(?cmd, "command without a client");
            return;
        };

        // Commands racing in behind a quit are dropped; the client is
        // already destroyed.
        if client.has_quit() {
            return;
        }

        client.active();
        if client.phase() == Phase::Normal {
            client.touch();
        }

        match cmd.kind {
            CommandKind::Nick { nickname } => self.handle_nick(&client, &nickname).await,
            CommandKind::User {
                username,
                mode,
                realname,
            } => self.handle_user(&client, &username, mode, &realname).await,
            CommandKind::Ping { token } => {
                let name = &self.handle.config.server_name;
                client.reply(reply::pong(name, &token)).await;
            }
            CommandKind::Pong { .. } => {
                // Nothing beyond the touch above.
            }
            CommandKind::Join { channels } => self.handle_join(&client, &channels).await,
            CommandKind::Part { channels, message } => {
                self.handle_part(&client, &channels, &message).await
            }
            CommandKind::Privmsg { target, text } => {
                self.handle_privmsg(&client, &target, &text).await
            }
            CommandKind::Quit { message } => client.quit(&message).await,
        }
    }

    async fn handle_nick(&mut self, client: &Arc<Client>, nickname: &str) {
        let name = self.handle.config.server_name.clone();
        if let Some(holder) = self.handle.registry.get(nickname) {
            // Renaming to the nickname you already hold is a no-op.
            if holder.id() == client.id() {
                return;
            }
            client
                .reply(reply::err_nickname_in_use(&name, client, nickname))
                .await;
            return;
        }

        let accepted = if client.phase() == Phase::Registration && !client.has_nick() {
            client.set_nickname(nickname)
        } else {
            client.change_nickname(nickname).await
        };
        if !accepted {
            // Lost a race with a concurrent claim; the registry refused.
            client
                .reply(reply::err_nickname_in_use(&name, client, nickname))
                .await;
            return;
        }

        self.try_register(client).await;
    }

    async fn handle_user(&mut self, client: &Arc<Client>, username: &str, mode: u8, realname: &str) {
        client.set_user(username, realname);
        // RFC 2812: bit 3 of the USER mode parameter requests invisibility.
        if mode & 8 != 0 {
            client.add_mode(UserMode::Invisible);
        }
        self.try_register(client).await;
    }

    /// Complete registration once both NICK and USER have arrived.
    async fn try_register(&mut self, client: &Arc<Client>) {
        if client.phase() != Phase::Registration || !client.has_nick() || !client.has_username() {
            return;
        }
        let name = &self.handle.config.server_name;
        client.reply(reply::rpl_welcome(name, client)).await;
        client.register();
        info!(client = %client, "registered");
    }

    async fn handle_join(&mut self, client: &Arc<Client>, names: &[String]) {
        for name in names {
            let channel = self
                .channels
                .entry(name.clone())
                .or_insert_with(|| Channel::new(name));
            channel.join(client);
            channel.broadcast(None, &reply::join(client, name)).await;
        }
    }

    async fn handle_part(&mut self, client: &Arc<Client>, names: &[String], message: &str) {
        let server_name = self.handle.config.server_name.clone();
        for name in names {
            let Some(channel) = self.channels.get(name).cloned() else {
                client
                    .reply(reply::err_no_such_channel(&server_name, client, name))
                    .await;
                continue;
            };

            channel
                .broadcast(None, &reply::part(client, name, message))
                .await;
            channel.part(client);

            if channel.is_empty() {
                self.channels.remove(name);
            }
        }
    }

    async fn handle_privmsg(&mut self, client: &Arc<Client>, target: &str, text: &str) {
        let server_name = self.handle.config.server_name.clone();
        let line = reply::privmsg(client, target, text);

        if target.starts_with('#') {
            match self.channels.get(target) {
                Some(channel) => channel.broadcast(Some(client.id()), &line).await,
                None => {
                    client
                        .reply(reply::err_no_such_channel(&server_name, client, target))
                        .await
                }
            }
            return;
        }

        match self.handle.registry.get(target) {
            Some(peer) => peer.reply(line).await,
            None => {
                client
                    .reply(reply::err_no_such_nick(&server_name, client, target))
                    .await
            }
        }
    }
}

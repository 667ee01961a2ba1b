/// Client actor: owns one connection's full lifecycle.
///
/// Each accepted connection gets a read pump, a write pump, and three
/// independently armed timers (login, idle, quit). All quit causes (user
/// QUIT, peer disconnect, socket EOF, timer expiry) funnel through the
/// command intake queue and end in a single `quit()` call guarded by
/// `has_quit`, so destruction and peer notification happen exactly once.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::channel::Channel;
use super::codec::LineCodec;
use super::command::{Command, CommandKind, ParseError};
use super::reply;
use super::server::{HostnameLookup, ServerHandle};

/// Capacity of the per-client reply queue. Producers await when it fills;
/// that is the backpressure point for a peer that stops draining.
pub const REPLY_QUEUE_DEPTH: usize = 16;

/// Combined async read+write trait for type-erased client streams.
pub trait LineTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineTransport for T {}

/// A connected stream suitable for framing with [`LineCodec`].
///
/// Type-erased so the actor doesn't depend on any concrete transport; both
/// `TcpStream` and in-memory duplex pipes satisfy this type.
pub type ClientStream = Box<dyn LineTransport>;

/// Coarse registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Registration,
    Normal,
}

/// User mode flags, rendered with a leading `+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserMode {
    Invisible,
    Operator,
    WallOps,
}

impl UserMode {
    pub fn symbol(self) -> char {
        match self {
            Self::Invisible => 'i',
            Self::Operator => 'o',
            Self::WallOps => 'w',
        }
    }
}

/// One item for the write pump. `Close` replaces the magic end-of-stream
/// string: it can never collide with legitimate reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Line(String),
    Close,
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct Identity {
    nick: String,
    username: String,
    realname: String,
    hostname: String,
    flags: HashSet<UserMode>,
}

#[derive(Debug, Default)]
struct Timers {
    login: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
    quit: Option<JoinHandle<()>>,
    /// Bumped by `touch` and `destroy`. A timer task captures the value
    /// current when it was armed and re-checks it under this lock before
    /// acting: `abort` only lands at an await point, so a timer whose sleep
    /// already finished can still run its synchronous tail. The stale
    /// generation makes that tail a no-op.
    generation: u64,
}

pub struct Client {
    id: u64,
    /// Self-reference for handing owned `Arc`s to timers, maps, and
    /// synthetic commands.
    me: Weak<Client>,
    server: ServerHandle,
    connected_at: SystemTime,
    last_active: Mutex<Instant>,
    identity: Mutex<Identity>,
    phase: Mutex<Phase>,
    /// Channels this client belongs to, keyed by channel name. The channel
    /// holds the member back-reference; both sides stay consistent through
    /// `Channel::join`/`part` and `destroy`.
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    /// Terminal flag. Once set, `reply` and `quit` are no-ops for everyone
    /// but the caller that won the transition.
    has_quit: AtomicBool,
    replies: mpsc::Sender<Outbound>,
    timers: Mutex<Timers>,
}

impl Client {
    /// Take ownership of a connection: record timestamps, seed the initial
    /// phase, arm the login timer, and start the read pump, the write pump,
    /// and the hostname-resolution hand-off.
    pub fn new(server: ServerHandle, stream: ClientStream, remote_addr: String) -> Arc<Self> {
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let init_phase = server.config.init_phase;

        let client = Arc::new_cyclic(|me| Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            server,
            connected_at: SystemTime::now(),
            last_active: Mutex::new(Instant::now()),
            identity: Mutex::new(Identity::default()),
            phase: Mutex::new(init_phase),
            channels: Mutex::new(HashMap::new()),
            has_quit: AtomicBool::new(false),
            replies: reply_tx,
            timers: Mutex::new(Timers::default()),
        });

        let (sink, lines) = Framed::new(stream, LineCodec).split();

        // One-slot hand-off of the remote address; the read pump forwards
        // it to the server-wide hostname intake.
        let (lookup_tx, lookup_rx) = mpsc::channel(1);
        let _ = lookup_tx.try_send(remote_addr);

        client.arm_login_timer();
        tokio::spawn(read_commands(Arc::clone(&client), lines, lookup_rx));
        tokio::spawn(write_replies(sink, reply_rx));

        client
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owned self-reference. A method can only run while at least one
    /// strong `Arc` to this client exists, so the upgrade always succeeds.
    fn me(&self) -> Arc<Client> {
        self.me.upgrade().expect("client self-reference expired")
    }

    // ── Timeout state machine ────────────────────────────────────

    fn arm_login_timer(&self) {
        let client = self.me();
        let timeout = self.server.config.login_timeout;
        let mut timers = self.timers.lock().unwrap();
        let generation = timers.generation;
        timers.login = Some(tokio::spawn(async move {
            sleep(timeout).await;
            client.connection_timeout(generation);
        }));
    }

    /// Cancel any pending quit timer and (re)arm the idle timer. Invoked by
    /// the dispatcher after routing each command from a registered client.
    pub fn touch(&self) {
        let timeout = self.server.config.idle_timeout;
        let mut timers = self.timers.lock().unwrap();
        if let Some(quit) = timers.quit.take() {
            quit.abort();
        }
        if let Some(idle) = timers.idle.take() {
            idle.abort();
        }
        timers.generation += 1;
        let generation = timers.generation;
        let client = self.me();
        timers.idle = Some(tokio::spawn(async move {
            sleep(timeout).await;
            client.connection_idle(generation).await;
        }));
    }

    /// Idle timer fired: ping the client and arm the quit timer. Bails out
    /// if a `touch` superseded the timer that got us here.
    async fn connection_idle(&self, generation: u64) {
        if self.timers.lock().unwrap().generation != generation {
            return;
        }

        self.reply(reply::ping(&self.server.config.server_name)).await;

        let client = self.me();
        let timeout = self.server.config.quit_timeout;
        let mut timers = self.timers.lock().unwrap();
        // Re-check: a touch may have landed while the ping was in flight.
        if timers.generation != generation {
            return;
        }
        timers.quit = Some(tokio::spawn(async move {
            sleep(timeout).await;
            client.connection_timeout(generation);
        }));
    }

    /// Login or quit timer fired: synthesize a timeout quit. Termination
    /// runs through the command-processing path like every other quit.
    fn connection_timeout(&self, generation: u64) {
        if self.timers.lock().unwrap().generation != generation {
            return;
        }
        let mut cmd = Command::new(CommandKind::Quit {
            message: "connection timeout".into(),
        });
        cmd.set_client(self.me());
        let _ = self.server.commands.send(cmd);
    }

    /// Registration completed: cancel the login timer for good and start
    /// the idle/quit cycle.
    pub fn register(&self) {
        *self.phase.lock().unwrap() = Phase::Normal;
        if let Some(login) = self.timers.lock().unwrap().login.take() {
            login.abort();
        }
        self.touch();
    }

    // ── Public operations ────────────────────────────────────────

    /// Stamp last-active time to now.
    pub fn active(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    /// Enqueue one line of outbound text. No-op once the client has quit.
    pub async fn reply(&self, line: String) {
        if self.has_quit.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.replies.send(Outbound::Line(line)).await;
    }

    /// Terminate the client. The first caller wins; every later quit cause
    /// (timeout, peer disconnect, repeated QUIT) is absorbed as a no-op.
    pub async fn quit(&self, message: &str) {
        if self
            .has_quit
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        // The winner of the transition writes the closing lines itself;
        // `reply` refuses everything else from here on. The write pump
        // drains pending replies, then closes the socket.
        let _ = self
            .replies
            .send(Outbound::Line(reply::error("connection closed")))
            .await;
        let _ = self.replies.send(Outbound::Close).await;

        let mut friends = self.friends();
        friends.remove(&self.id);
        self.destroy();

        if !friends.is_empty() {
            let notice = reply::quit(self, message);
            for friend in friends.values() {
                friend.reply(notice.clone()).await;
            }
        }
    }

    /// Stop all timers, leave every joined channel, and drop out of the
    /// registry. Runs exactly once, from `quit`.
    fn destroy(&self) {
        let mut timers = self.timers.lock().unwrap();
        for timer in [timers.login.take(), timers.idle.take(), timers.quit.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        timers.generation += 1;
        drop(timers);

        let channels: Vec<Arc<Channel>> = self
            .channels
            .lock()
            .unwrap()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in &channels {
            channel.notify_quit(self);
        }

        self.server.registry.remove(self);
        debug!(client = %self, "destroyed");
    }

    // ── Friends / identity mutation ──────────────────────────────

    /// The broadcast set: this client plus every member of every channel it
    /// belongs to, de-duplicated by client id.
    pub fn friends(&self) -> HashMap<u64, Arc<Client>> {
        let mut friends = HashMap::new();
        friends.insert(self.id, self.me());

        let channels: Vec<Arc<Channel>> =
            self.channels.lock().unwrap().values().cloned().collect();
        for channel in channels {
            for member in channel.members() {
                friends.insert(member.id(), member);
            }
        }
        friends
    }

    /// First nickname assignment: set the nick, then insert into the
    /// registry. Returns false if the key is already taken.
    pub fn set_nickname(&self, nickname: &str) -> bool {
        self.identity.lock().unwrap().nick = nickname.to_owned();
        self.server.registry.add(self.me())
    }

    /// Rename: the notice is rendered with the old identity before any
    /// mutation, the registry entry moves remove-then-insert so two live
    /// entries never share a key, and every friend, self included, gets
    /// the notice. Returns false if the new key is already taken (callers
    /// pre-validate; the registry refusal is the invariant backstop).
    pub async fn change_nickname(&self, nickname: &str) -> bool {
        let notice = reply::nick(self, nickname);
        let old_nick = self.identity.lock().unwrap().nick.clone();

        self.server.registry.remove(self);
        self.identity.lock().unwrap().nick = nickname.to_owned();
        if !self.server.registry.add(self.me()) {
            // Refused: restore the old nickname and its registry entry so
            // the client is never left half-renamed. The old key was freed
            // by the remove above, so re-adding cannot fail.
            self.identity.lock().unwrap().nick = old_nick;
            let _ = self.server.registry.add(self.me());
            return false;
        }

        for friend in self.friends().values() {
            friend.reply(notice.clone()).await;
        }
        true
    }

    // ── Membership bookkeeping (driven by Channel) ───────────────

    pub(crate) fn joined(&self, channel: Arc<Channel>) {
        self.channels
            .lock()
            .unwrap()
            .insert(channel.name().to_owned(), channel);
    }

    pub(crate) fn parted(&self, name: &str) {
        self.channels.lock().unwrap().remove(name);
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    // ── Identity mutation from the dispatcher / resolver ─────────

    pub fn set_user(&self, username: &str, realname: &str) {
        let mut identity = self.identity.lock().unwrap();
        identity.username = username.to_owned();
        identity.realname = realname.to_owned();
    }

    pub fn add_mode(&self, mode: UserMode) {
        self.identity.lock().unwrap().flags.insert(mode);
    }

    pub fn remove_mode(&self, mode: UserMode) {
        self.identity.lock().unwrap().flags.remove(&mode);
    }

    /// Filled in asynchronously once the resolver answers.
    pub fn set_hostname(&self, hostname: String) {
        self.identity.lock().unwrap().hostname = hostname;
    }

    // ── Read-only accessors ──────────────────────────────────────

    /// The nickname, or `*` while still unknown.
    pub fn nick(&self) -> String {
        let identity = self.identity.lock().unwrap();
        if identity.nick.is_empty() {
            "*".to_owned()
        } else {
            identity.nick.clone()
        }
    }

    /// `nick!user@host` identity string.
    pub fn user_host(&self) -> String {
        let identity = self.identity.lock().unwrap();
        let nick = if identity.nick.is_empty() {
            "*"
        } else {
            &identity.nick
        };
        let username = if identity.username.is_empty() {
            "*"
        } else {
            &identity.username
        };
        format!("{nick}!{username}@{}", identity.hostname)
    }

    pub fn has_nick(&self) -> bool {
        !self.identity.lock().unwrap().nick.is_empty()
    }

    pub fn has_username(&self) -> bool {
        !self.identity.lock().unwrap().username.is_empty()
    }

    pub fn realname(&self) -> String {
        self.identity.lock().unwrap().realname.clone()
    }

    pub fn hostname(&self) -> String {
        self.identity.lock().unwrap().hostname.clone()
    }

    /// Rendered mode flags (`+iw`), empty when no flags are set.
    pub fn mode_string(&self) -> String {
        let identity = self.identity.lock().unwrap();
        if identity.flags.is_empty() {
            return String::new();
        }
        let mut out = String::from("+");
        for flag in &identity.flags {
            out.push(flag.symbol());
        }
        out
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn has_quit(&self) -> bool {
        self.has_quit.load(Ordering::SeqCst)
    }

    pub fn idle_time(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    pub fn idle_seconds(&self) -> u64 {
        self.idle_time().as_secs()
    }

    /// Signon time as seconds since the Unix epoch.
    pub fn signon_time(&self) -> u64 {
        self.connected_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    // ── Read pump internals ──────────────────────────────────────

    async fn incoming_line(&self, line: &str) {
        match Command::parse(line) {
            Ok(mut cmd) => {
                cmd.set_client(self.me());
                let _ = self.server.commands.send(cmd);
            }
            Err(ParseError::NotEnoughArgs) => {
                let verb = line.split(' ').next().unwrap_or(line);
                let text =
                    reply::err_need_more_params(&self.server.config.server_name, self, verb);
                self.reply(text).await;
            }
            // Other parse failures are dropped without a reply.
            Err(_) => {}
        }
    }

    /// The transport ended: synthesize a quit, same path as any other.
    fn connection_closed(&self) {
        let mut cmd = Command::new(CommandKind::Quit {
            message: "connection closed".into(),
        });
        cmd.set_client(self.me());
        let _ = self.server.commands.send(cmd);
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_host())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("nick", &self.nick())
            .finish()
    }
}

// ── Pumps ────────────────────────────────────────────────────────

/// Read pump: waits on the hostname hand-off and the line stream, whichever
/// is ready. Exits on EOF (or a framing error) through the synthetic-quit
/// path; never restarts.
async fn read_commands(
    client: Arc<Client>,
    mut lines: SplitStream<Framed<ClientStream, LineCodec>>,
    mut lookups: mpsc::Receiver<String>,
) {
    loop {
        tokio::select! {
            Some(addr) = lookups.recv() => {
                let _ = client.server.hostnames.send(HostnameLookup {
                    client: Arc::clone(&client),
                    addr,
                });
            }
            frame = lines.next() => match frame {
                Some(Ok(line)) => client.incoming_line(&line).await,
                Some(Err(e)) => {
                    // The stream is no longer line-coherent; treat as EOF.
                    warn!(client = %client, "read error: {e}");
                    break;
                }
                None => break,
            },
        }
    }

    client.connection_closed();
}

/// Write pump: drains the reply queue in FIFO order. Exits on the `Close`
/// marker or a write failure, and closes the transport as its last act.
/// That close is the only one, no matter how the read pump finished.
async fn write_replies(
    mut sink: SplitSink<Framed<ClientStream, LineCodec>, String>,
    mut replies: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = replies.recv().await {
        match item {
            Outbound::Line(line) => {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = sink.close().await;
}

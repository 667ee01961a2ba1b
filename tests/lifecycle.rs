/// Integration tests for the connection lifecycle over real TCP.
///
/// Each test boots a server on an ephemeral port inside its own runtime and
/// drives it with simple blocking clients:
///
/// - registration (NICK + USER) ends with the 001 welcome
/// - channel joins, messages, renames, and quits fan out to channel peers
/// - idle connections get pinged, silent ones get disconnected
/// - unregistered connections are dropped after the login timeout
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread::sleep;
use std::time::Duration;

use driftwood::irc::server::{self, Config, Server};

/// Boot a server with the given config; returns its runtime (kept alive for
/// the duration of the test) and the bound address.
fn start_server(config: Config) -> (tokio::runtime::Runtime, SocketAddr) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let addr = rt.block_on(async {
        let handle = Server::new(config).spawn();
        server::listen(&handle, "127.0.0.1:0").await.unwrap()
    });
    (rt, addr)
}

fn test_config() -> Config {
    Config {
        server_name: "test.driftwood".into(),
        login_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(30),
        quit_timeout: Duration::from_secs(30),
        ..Config::default()
    }
}

/// Simple blocking IRC client for testing.
struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    lines: Vec<String>,
}

impl TestClient {
    /// Connect without registering.
    fn connect_raw(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        stream.set_read_timeout(Some(Duration::from_secs(3)))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            lines: Vec::new(),
        })
    }

    /// Connect and register; reads until the 001 welcome.
    fn connect(addr: SocketAddr, nick: &str) -> io::Result<Self> {
        let mut client = Self::connect_raw(addr)?;
        client.send(&format!("NICK {nick}"))?;
        client.send(&format!("USER {nick} 0 * :{nick}"))?;
        client.read_until(" 001 ")?;
        Ok(client)
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}\r")?;
        self.writer.flush()
    }

    /// Read lines until one contains the given substring, or timeout.
    /// Returns the matching line.
    fn read_until(&mut self, marker: &str) -> io::Result<String> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    ))
                }
                Ok(_) => {
                    let trimmed = line.trim_end().to_string();
                    self.lines.push(trimmed.clone());
                    if trimmed.contains(marker) {
                        return Ok(trimmed);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("timeout waiting for '{marker}'"),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one line, expecting end-of-stream instead.
    fn expect_closed(&mut self) {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {}
            Ok(_) => panic!("expected closed stream, got line: {}", line.trim_end()),
            Err(e) => panic!("expected clean close, got error: {e}"),
        }
    }

    /// Drop the write half without sending QUIT.
    fn hang_up(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

#[test]
fn registration_ends_with_welcome() {
    let (_rt, addr) = start_server(test_config());

    let mut alice = TestClient::connect_raw(addr).unwrap();
    alice.send("NICK alice").unwrap();
    alice.send("USER al 0 * :Alice").unwrap();

    let welcome = alice.read_until(" 001 ").unwrap();
    assert!(
        welcome.starts_with(":test.driftwood 001 alice :Welcome"),
        "got: {welcome}"
    );
}

#[test]
fn incomplete_commands_get_461_before_registration() {
    let (_rt, addr) = start_server(test_config());

    let mut client = TestClient::connect_raw(addr).unwrap();
    client.send("NICK").unwrap();

    let line = client.read_until(" 461 ").unwrap();
    assert_eq!(line, ":test.driftwood 461 * NICK :Not enough parameters");
}

#[test]
fn second_client_cannot_take_a_registered_nickname() {
    let (_rt, addr) = start_server(test_config());

    let _alice = TestClient::connect(addr, "alice").unwrap();

    let mut impostor = TestClient::connect_raw(addr).unwrap();
    impostor.send("NICK alice").unwrap();
    let line = impostor.read_until(" 433 ").unwrap();
    assert_eq!(
        line,
        ":test.driftwood 433 * alice :Nickname is already in use"
    );
}

#[test]
fn channel_messages_reach_peers_but_not_the_sender() {
    let (_rt, addr) = start_server(test_config());

    let mut alice = TestClient::connect(addr, "alice").unwrap();
    let mut bob = TestClient::connect(addr, "bob").unwrap();

    alice.send("JOIN #driftwood").unwrap();
    alice.read_until("JOIN :#driftwood").unwrap();
    bob.send("JOIN #driftwood").unwrap();
    bob.read_until("JOIN :#driftwood").unwrap();
    alice.read_until(":bob!").unwrap(); // bob's join, seen by alice

    alice.send("PRIVMSG #driftwood :morning all").unwrap();
    let msg = bob.read_until("PRIVMSG #driftwood :morning all").unwrap();
    assert!(msg.starts_with(":alice!"), "got: {msg}");

    // The sender must not see its own channel message. PONG's reply acts
    // as the fence: anything queued before it would arrive first.
    alice.send("PING :fence").unwrap();
    let next = alice.read_until(":fence").unwrap();
    assert!(next.contains("PONG"), "got: {next}");
    assert!(
        !alice.lines.iter().any(|l| l.contains("PRIVMSG #driftwood")),
        "sender saw its own message: {:?}",
        alice.lines
    );
}

#[test]
fn rename_notice_carries_the_old_identity() {
    let (_rt, addr) = start_server(test_config());

    let mut alice = TestClient::connect(addr, "alice").unwrap();
    let mut bob = TestClient::connect(addr, "bob").unwrap();

    alice.send("JOIN #driftwood").unwrap();
    alice.read_until("JOIN :#driftwood").unwrap();
    bob.send("JOIN #driftwood").unwrap();
    bob.read_until("JOIN :#driftwood").unwrap();

    alice.send("NICK alicia").unwrap();

    // Both the co-member and alice herself see the notice, prefixed with
    // the old nickname.
    let seen = bob.read_until("NICK :alicia").unwrap();
    assert!(seen.starts_with(":alice!"), "got: {seen}");
    let own = alice.read_until("NICK :alicia").unwrap();
    assert!(own.starts_with(":alice!"), "got: {own}");

    // The new nickname is live, the old one is free again.
    let mut carol = TestClient::connect_raw(addr).unwrap();
    carol.send("NICK alicia").unwrap();
    carol.read_until(" 433 ").unwrap();
    carol.send("NICK alice").unwrap();
    carol.send("USER c 0 * :Carol").unwrap();
    carol.read_until(" 001 ").unwrap();
}

#[test]
fn quit_notifies_channel_peers_and_closes_the_socket() {
    let (_rt, addr) = start_server(test_config());

    let mut alice = TestClient::connect(addr, "alice").unwrap();
    let mut bob = TestClient::connect(addr, "bob").unwrap();

    alice.send("JOIN #driftwood").unwrap();
    alice.read_until("JOIN :#driftwood").unwrap();
    bob.send("JOIN #driftwood").unwrap();
    bob.read_until("JOIN :#driftwood").unwrap();

    alice.send("QUIT :gone fishing").unwrap();
    alice.read_until("ERROR :connection closed").unwrap();
    alice.expect_closed();

    let notice = bob.read_until("QUIT :gone fishing").unwrap();
    assert!(notice.starts_with(":alice!"), "got: {notice}");
}

#[test]
fn dropped_connection_looks_like_a_quit_to_peers() {
    let (_rt, addr) = start_server(test_config());

    let mut alice = TestClient::connect(addr, "alice").unwrap();
    let mut bob = TestClient::connect(addr, "bob").unwrap();

    alice.send("JOIN #driftwood").unwrap();
    alice.read_until("JOIN :#driftwood").unwrap();
    bob.send("JOIN #driftwood").unwrap();
    bob.read_until("JOIN :#driftwood").unwrap();

    alice.hang_up();

    let notice = bob.read_until("QUIT :connection closed").unwrap();
    assert!(notice.starts_with(":alice!"), "got: {notice}");
}

#[test]
fn silent_client_is_pinged_then_disconnected() {
    let (_rt, addr) = start_server(Config {
        idle_timeout: Duration::from_millis(200),
        quit_timeout: Duration::from_millis(200),
        ..test_config()
    });

    let mut alice = TestClient::connect(addr, "alice").unwrap();

    alice.read_until("PING :test.driftwood").unwrap();
    // Say nothing; the quit timer fires.
    alice.read_until("ERROR :connection closed").unwrap();
    alice.expect_closed();
}

#[test]
fn answering_the_idle_ping_keeps_the_connection_alive() {
    let (_rt, addr) = start_server(Config {
        idle_timeout: Duration::from_millis(200),
        quit_timeout: Duration::from_millis(400),
        ..test_config()
    });

    let mut alice = TestClient::connect(addr, "alice").unwrap();

    // Survive two full idle cycles by answering each ping.
    for _ in 0..2 {
        alice.read_until("PING :test.driftwood").unwrap();
        alice.send("PONG :test.driftwood").unwrap();
    }

    // Still connected and responsive.
    alice.send("PING :still-here").unwrap();
    let pong = alice.read_until(":still-here").unwrap();
    assert!(pong.contains("PONG"), "got: {pong}");
}

#[test]
fn unregistered_connection_hits_the_login_timeout() {
    let (_rt, addr) = start_server(Config {
        login_timeout: Duration::from_millis(200),
        ..test_config()
    });

    let mut lurker = TestClient::connect_raw(addr).unwrap();
    // A nick alone does not complete registration.
    lurker.send("NICK lurker").unwrap();

    lurker.read_until("ERROR :connection closed").unwrap();
    lurker.expect_closed();
}

#[test]
fn registration_disarms_the_login_timeout() {
    let (_rt, addr) = start_server(Config {
        login_timeout: Duration::from_millis(200),
        ..test_config()
    });

    let mut alice = TestClient::connect(addr, "alice").unwrap();

    // Well past the login deadline; a registered client is unaffected.
    sleep(Duration::from_millis(500));
    alice.send("PING :alive").unwrap();
    let pong = alice.read_until(":alive").unwrap();
    assert!(pong.contains("PONG"), "got: {pong}");
}

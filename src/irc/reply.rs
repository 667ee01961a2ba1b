/// Reply text formatting: builds the outbound lines the rest of the core
/// treats as opaque. Notification sources use the sender's `nick!user@host`
/// identity; numerics carry the server name as prefix.
use super::client::Client;

pub fn ping(server_name: &str) -> String {
    format!("PING :{server_name}")
}

pub fn pong(server_name: &str, token: &str) -> String {
    format!(":{server_name} PONG {server_name} :{token}")
}

pub fn error(reason: &str) -> String {
    format!("ERROR :{reason}")
}

/// QUIT notification delivered to a departing client's friends.
pub fn quit(client: &Client, message: &str) -> String {
    format!(":{} QUIT :{message}", client.user_host())
}

/// NICK notification. Must be rendered from the *old* identity, so callers
/// build it before mutating the nickname.
pub fn nick(client: &Client, new_nick: &str) -> String {
    format!(":{} NICK :{new_nick}", client.user_host())
}

pub fn join(client: &Client, channel: &str) -> String {
    format!(":{} JOIN :{channel}", client.user_host())
}

pub fn part(client: &Client, channel: &str, message: &str) -> String {
    format!(":{} PART {channel} :{message}", client.user_host())
}

pub fn privmsg(client: &Client, target: &str, text: &str) -> String {
    format!(":{} PRIVMSG {target} :{text}", client.user_host())
}

// ── Numerics ─────────────────────────────────────────────────────

pub fn rpl_welcome(server_name: &str, client: &Client) -> String {
    format!(
        ":{server_name} 001 {} :Welcome to the Internet Relay Network {}",
        client.nick(),
        client.user_host()
    )
}

pub fn err_no_such_nick(server_name: &str, client: &Client, target: &str) -> String {
    format!(
        ":{server_name} 401 {} {target} :No such nick/channel",
        client.nick()
    )
}

pub fn err_no_such_channel(server_name: &str, client: &Client, channel: &str) -> String {
    format!(
        ":{server_name} 403 {} {channel} :No such channel",
        client.nick()
    )
}

pub fn err_nickname_in_use(server_name: &str, client: &Client, taken: &str) -> String {
    format!(
        ":{server_name} 433 {} {taken} :Nickname is already in use",
        client.nick()
    )
}

pub fn err_need_more_params(server_name: &str, client: &Client, verb: &str) -> String {
    format!(
        ":{server_name} 461 {} {verb} :Not enough parameters",
        client.nick()
    )
}

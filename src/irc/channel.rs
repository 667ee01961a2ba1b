/// Channel: a named member set with symmetric membership bookkeeping.
///
/// A client is a member of a channel iff the channel lists it; `join`/`part`
/// maintain both sides, and `notify_quit` is the destroy-path hook a
/// departing client invokes once per joined channel.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use super::client::Client;

#[derive(Debug)]
pub struct Channel {
    name: String,
    /// Self-reference, handed to joining clients for their membership map.
    me: Weak<Channel>,
    /// Members keyed by client id (nicknames change; ids don't).
    members: Mutex<HashMap<u64, Arc<Client>>>,
}

impl Channel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_owned(),
            me: me.clone(),
            members: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a client to the channel and the channel to the client.
    pub fn join(&self, client: &Arc<Client>) {
        self.members
            .lock()
            .unwrap()
            .insert(client.id(), Arc::clone(client));
        client.joined(self.me.upgrade().expect("channel self-reference expired"));
    }

    /// Remove a client from the channel and the channel from the client.
    pub fn part(&self, client: &Client) {
        self.members.lock().unwrap().remove(&client.id());
        client.parted(&self.name);
    }

    /// Departure notice from a quitting client's `destroy`. The client has
    /// already dropped its own membership pointer.
    pub fn notify_quit(&self, client: &Client) {
        self.members.lock().unwrap().remove(&client.id());
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Arc<Client>> {
        self.members.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().unwrap().is_empty()
    }

    /// Send a line to every member, optionally excluding one client id.
    pub async fn broadcast(&self, except: Option<u64>, line: &str) {
        for member in self.members() {
            if Some(member.id()) == except {
                continue;
            }
            member.reply(line.to_owned()).await;
        }
    }
}

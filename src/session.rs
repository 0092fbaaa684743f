use std::fmt;
use std::os::unix::io::RawFd;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::From)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// What a session's sockets carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// persistent FTP control connection
    Command,
    /// per-transfer data connection
    Data,
}

/// Which of a session's two endpoints an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// One client-side endpoint paired with one server-side endpoint.
///
/// A session is always fully wired: both endpoints are present and open for
/// its whole registered lifetime. A data session whose peer has not connected
/// yet holds a live listening endpoint on that side until the relay engine
/// swaps in the accepted connection.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    client: Endpoint,
    server: Endpoint,
    /// owning command session (data sessions only)
    owner: Option<SessionId>,
    /// live child data sessions (command sessions only)
    children: Vec<SessionId>,
    /// a PASV went upstream; intercept the next 227 reply from the server
    awaiting_pasv_reply: bool,
    /// per-direction: relaying an oversized line, unclassified until its
    /// terminator
    overflow: [bool; 2],
}

fn side_index(side: Side) -> usize {
    match side {
        Side::Client => 0,
        Side::Server => 1,
    }
}

impl Session {
    pub fn command(id: SessionId, client: Endpoint, server: Endpoint) -> Self {
        Self {
            id,
            role: Role::Command,
            client,
            server,
            owner: None,
            children: Vec::new(),
            awaiting_pasv_reply: false,
            overflow: [false; 2],
        }
    }

    pub fn data(id: SessionId, owner: SessionId, client: Endpoint, server: Endpoint) -> Self {
        Self {
            id,
            role: Role::Data,
            client,
            server,
            owner: Some(owner),
            children: Vec::new(),
            awaiting_pasv_reply: false,
            overflow: [false; 2],
        }
    }

    pub fn owner(&self) -> Option<SessionId> {
        self.owner
    }

    pub fn children(&self) -> &[SessionId] {
        &self.children
    }

    pub fn add_child(&mut self, id: SessionId) {
        self.children.push(id);
    }

    pub fn remove_child(&mut self, id: SessionId) {
        self.children.retain(|c| *c != id);
    }

    pub fn awaiting_pasv_reply(&self) -> bool {
        self.awaiting_pasv_reply
    }

    pub fn set_awaiting_pasv_reply(&mut self, value: bool) {
        self.awaiting_pasv_reply = value;
    }

    pub fn in_overflow(&self, side: Side) -> bool {
        self.overflow[side_index(side)]
    }

    pub fn set_in_overflow(&mut self, side: Side, value: bool) {
        self.overflow[side_index(side)] = value;
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    pub fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Both endpoints, source side first.
    pub fn pair_mut(&mut self, src: Side) -> (&mut Endpoint, &mut Endpoint) {
        match src {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        }
    }

    /// Which side a readiness event's fd belongs to.
    pub fn side_of(&self, fd: RawFd) -> Option<Side> {
        if self.client.handle() == fd {
            Some(Side::Client)
        } else if self.server.handle() == fd {
            Some(Side::Server)
        } else {
            None
        }
    }

    pub fn handles(&self) -> [RawFd; 2] {
        [self.client.handle(), self.server.handle()]
    }

    /// Replace one side's endpoint (listener → accepted connection),
    /// returning the old one for deregistration and closing.
    pub fn swap_endpoint(&mut self, side: Side, new: Endpoint) -> Endpoint {
        match side {
            Side::Client => std::mem::replace(&mut self.client, new),
            Side::Server => std::mem::replace(&mut self.server, new),
        }
    }

    /// Close both endpoints. Idempotent, as `Endpoint::close` is.
    pub fn close(&mut self) {
        self.client.close();
        self.server.close();
    }
}

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;

use crate::command;
use crate::config::GatewayConfig;
use crate::endpoint::{Endpoint, ReadOutcome};
use crate::error::{Error, Result};
use crate::poll::{Interest, Poller, Readiness};
use crate::registry::SessionRegistry;
use crate::relay::{self, ControlLine, PumpOutcome};
use crate::session::{Role, Session, SessionId, Side};

/// How long one poll iteration may block before the shutdown flag is
/// re-checked.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The gateway: owns the readiness set, the session registry, and the
/// command-channel listener, and drives everything from a single thread.
///
/// Registry and readiness-set mutations always happen together, here, so a
/// handle can never exist in one but not the other.
pub struct Server {
    config: GatewayConfig,
    poller: Poller,
    registry: SessionRegistry,
    listener: Endpoint,
    next_id: u64,
}

impl Server {
    /// Bind the command-channel listener and create the readiness set.
    /// Failures here are process-wide setup errors and therefore fatal.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let listener = Endpoint::listen(
            config.listen_addr(),
            config.backlog,
            config.buffer_size(),
        )?;
        let poller = Poller::new()?;
        poller.register(listener.handle(), Interest::Read)?;
        info!(
            "gateway listening on {}, upstream {}",
            listener.local_addr()?,
            config.upstream_addr
        );
        Ok(Self {
            config,
            poller,
            registry: SessionRegistry::new(),
            listener,
            next_id: 0,
        })
    }

    /// Actual bound listen address (useful when configured with port 0).
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the event loop until `running` is cleared.
    ///
    /// Per-connection failures are logged and tear down only the session
    /// involved; this returns `Err` only on readiness-set failures.
    pub fn serve(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        while running.load(Ordering::Relaxed) {
            let ready = self.poller.wait(Some(POLL_INTERVAL))?;
            for r in ready {
                if r.fd == self.listener.handle() {
                    self.accept_clients();
                } else if let Err(err) = self.dispatch(r) {
                    warn!("session error on fd {}: {}", r.fd, err);
                    if let Ok(id) = self.registry.id_of(r.fd) {
                        self.teardown(id, "i/o error");
                    }
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Close every session and the listener. Called on shutdown request;
    /// leaves no socket registered.
    fn shutdown(&mut self) {
        info!("gateway shutdown: {} sessions live", self.registry.len());
        for id in self.registry.ids() {
            self.teardown(id, "shutdown");
        }
        self.poller.deregister(self.listener.handle()).ok();
        self.listener.close();
    }

    fn next_session_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    /// Drain the accept queue, wiring a command session per client.
    /// A failed upstream connect drops that client only.
    fn accept_clients(&mut self) {
        loop {
            match Endpoint::accept_from(&self.listener, self.config.buffer_size()) {
                Ok(Some(client)) => {
                    let peer = client.peer_addr();
                    if let Err(err) = self.start_command_session(client) {
                        warn!("client {} rejected: {}", peer, err);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn start_command_session(&mut self, client: Endpoint) -> Result<()> {
        let peer = client.peer_addr();
        let upstream = Endpoint::connect(self.config.upstream_addr, self.config.buffer_size())?;
        let id = self.next_session_id();
        self.install(Session::command(id, client, upstream))?;
        info!(
            "session created: {} (command): {} <-> {}",
            id, peer, self.config.upstream_addr
        );
        Ok(())
    }

    /// Register a session with the registry and both of its handles with
    /// the readiness set, as one step. On failure nothing stays behind.
    fn install(&mut self, session: Session) -> Result<()> {
        let id = session.id;
        let [client_fd, server_fd] = session.handles();
        self.registry.register(session)?;
        if let Err(err) = self.poller.register(client_fd, Interest::Read) {
            self.registry.remove_by_id(id).ok();
            return Err(err);
        }
        if let Err(err) = self.poller.register(server_fd, Interest::Read) {
            self.poller.deregister(client_fd).ok();
            self.registry.remove_by_id(id).ok();
            return Err(err);
        }
        Ok(())
    }

    /// Remove a session: deregister both handles, then close both
    /// endpoints. Closing a command session also closes all of its data
    /// sessions; closing a data session unlinks it from its owner.
    fn teardown(&mut self, id: SessionId, reason: &str) {
        let (handles, role, owner, children) = match self.registry.get(id) {
            Some(s) => (s.handles(), s.role, s.owner(), s.children().to_vec()),
            None => return,
        };
        for fd in handles {
            self.poller.deregister(fd).ok();
        }
        self.registry.remove_by_id(id).ok();
        info!("session closed: {} ({:?}): {}", id, role, reason);
        match role {
            Role::Command => {
                for child in children {
                    self.teardown(child, "command session closed");
                }
            }
            Role::Data => {
                if let Some(owner) = owner {
                    if let Some(cmd) = self.registry.get_mut(owner) {
                        cmd.remove_child(id);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, r: Readiness) -> Result<()> {
        let id = match self.registry.id_of(r.fd) {
            Ok(id) => id,
            // session was torn down earlier in this batch
            Err(_) => {
                trace!("stale readiness event for fd {}", r.fd);
                return Ok(());
            }
        };
        let (role, side, listening) = {
            let s = self.registry.get(id).ok_or(Error::NotFound(r.fd))?;
            let side = s.side_of(r.fd).ok_or(Error::NotFound(r.fd))?;
            (s.role, side, s.endpoint(side).is_listening())
        };

        if listening {
            if r.readable {
                self.accept_data_peer(id, side)?;
            }
            return Ok(());
        }
        if r.hangup && !r.readable {
            self.teardown(id, "connection reset or hangup");
            return Ok(());
        }
        match role {
            Role::Data => self.step_data(id, side, r),
            Role::Command => self.step_command(id, side, r),
        }
    }

    /// One relay step for a data session.
    fn step_data(&mut self, id: SessionId, side: Side, r: Readiness) -> Result<()> {
        let outcome = {
            let s = self.registry.get_mut(id).ok_or(Error::NotFound(r.fd))?;
            relay::pump(s, side, r.readable, r.writable)?
        };
        match outcome {
            PumpOutcome::PeerClosed(side) => {
                self.teardown(id, if side == Side::Client {
                    "client closed data channel"
                } else {
                    "server closed data channel"
                });
            }
            PumpOutcome::Continue => self.refresh_interest(id),
        }
        Ok(())
    }

    /// One step for a command session: flush, read, interpret complete
    /// lines, forward (rewritten where a negotiation was intercepted).
    fn step_command(&mut self, id: SessionId, side: Side, r: Readiness) -> Result<()> {
        if r.writable {
            let s = self.registry.get_mut(id).ok_or(Error::NotFound(r.fd))?;
            s.endpoint_mut(side).flush_pending()?;
            // lines deferred under back-pressure may fit now
            self.process_command_lines(id, side.other())?;
        }
        if r.readable {
            let closed = {
                let s = self.registry.get_mut(id).ok_or(Error::NotFound(r.fd))?;
                matches!(
                    s.endpoint_mut(side).read_into_buffer()?,
                    ReadOutcome::Closed
                )
            };
            if closed {
                self.teardown(id, "peer closed command channel");
                return Ok(());
            }
            self.process_command_lines(id, side)?;
            let s = self.registry.get_mut(id).ok_or(Error::NotFound(r.fd))?;
            s.endpoint_mut(side.other()).flush_pending()?;
        }
        self.refresh_interest(id);
        Ok(())
    }

    /// Interpret every complete line buffered on `side`, queueing each for
    /// the opposite endpoint in arrival order. `PORT` lines and intercepted
    /// `227` replies trigger a data-channel negotiation and are replaced
    /// with the proxy's own address; everything else passes through.
    fn process_command_lines(&mut self, id: SessionId, side: Side) -> Result<()> {
        let dst = side.other();
        loop {
            let line = {
                let s = self.registry.get_mut(id).ok_or(Error::NotFound(-1))?;
                // back-pressure: stop interpreting while the destination
                // queue is backed up
                if s.endpoint(dst).pending_len() >= s.endpoint(dst).capacity() {
                    break;
                }
                relay::next_control_line(s, side)
            };
            let Some(line) = line else { break };
            let out = match line {
                ControlLine::Plain(bytes)
                | ControlLine::Pasv(bytes)
                | ControlLine::Overflow(bytes) => bytes,
                ControlLine::Port(bytes, target) => match self.open_active_data(id, target) {
                    Ok(rewritten) => rewritten,
                    Err(err) => {
                        warn!(
                            "session {}: active negotiation toward {} failed: {}",
                            id, target, err
                        );
                        bytes
                    }
                },
                ControlLine::PasvReply(bytes, target) => {
                    match self.open_passive_data(id, target) {
                        Ok(rewritten) => rewritten,
                        Err(err) => {
                            warn!(
                                "session {}: passive negotiation toward {} failed: {}",
                                id, target, err
                            );
                            bytes
                        }
                    }
                }
            };
            let s = self.registry.get_mut(id).ok_or(Error::NotFound(-1))?;
            s.endpoint_mut(dst).queue(&out);
        }
        Ok(())
    }

    /// Active mode: the client advertised `target` in a `PORT` command.
    /// Connect toward it, listen for the server on the upstream-facing
    /// interface, and return the rewritten `PORT` line to forward.
    fn open_active_data(&mut self, cmd_id: SessionId, target: SocketAddrV4) -> Result<Vec<u8>> {
        let local = {
            let s = self.registry.get(cmd_id).ok_or(Error::NotFound(-1))?;
            s.endpoint(Side::Server).local_addr()?
        };
        let (listener, advertised) = self.data_listener_on(local)?;
        let client_end = Endpoint::connect(SocketAddr::V4(target), self.config.buffer_size())?;
        let child_id = self.spawn_data_session(cmd_id, client_end, listener)?;
        info!(
            "session created: {} (data, active): toward {}, advertising {}",
            child_id, target, advertised
        );
        Ok(command::generate_port_command(advertised).into_bytes())
    }

    /// Passive mode: the server advertised `target` in a `227` reply.
    /// Connect toward it, listen for the client on the client-facing
    /// interface, and return the rewritten reply to forward.
    fn open_passive_data(&mut self, cmd_id: SessionId, target: SocketAddrV4) -> Result<Vec<u8>> {
        let local = {
            let s = self.registry.get(cmd_id).ok_or(Error::NotFound(-1))?;
            s.endpoint(Side::Client).local_addr()?
        };
        let (listener, advertised) = self.data_listener_on(local)?;
        let server_end = Endpoint::connect(SocketAddr::V4(target), self.config.buffer_size())?;
        let child_id = self.spawn_data_session(cmd_id, listener, server_end)?;
        info!(
            "session created: {} (data, passive): toward {}, advertising {}",
            child_id, target, advertised
        );
        Ok(command::generate_pasv_reply(advertised).into_bytes())
    }

    /// Ephemeral data listener on the same interface as `local`.
    fn data_listener_on(&self, local: SocketAddr) -> Result<(Endpoint, SocketAddrV4)> {
        let listener = Endpoint::listen(
            SocketAddr::new(local.ip(), 0),
            self.config.backlog,
            self.config.buffer_size(),
        )?;
        match listener.local_addr()? {
            SocketAddr::V4(addr) => Ok((listener, addr)),
            SocketAddr::V6(addr) => {
                // PORT/227 encode IPv4 only
                Err(Error::malformed_address(addr.to_string().as_bytes()))
            }
        }
    }

    fn spawn_data_session(
        &mut self,
        cmd_id: SessionId,
        client_end: Endpoint,
        server_end: Endpoint,
    ) -> Result<SessionId> {
        let child_id = self.next_session_id();
        self.install(Session::data(child_id, cmd_id, client_end, server_end))?;
        if let Some(cmd) = self.registry.get_mut(cmd_id) {
            cmd.add_child(child_id);
        }
        Ok(child_id)
    }

    /// A data session's listening side became readable: swap the listener
    /// for the accepted connection, keeping registry and readiness set in
    /// step.
    fn accept_data_peer(&mut self, id: SessionId, side: Side) -> Result<()> {
        let accepted = {
            let s = self.registry.get(id).ok_or(Error::NotFound(-1))?;
            match Endpoint::accept_from(s.endpoint(side), self.config.buffer_size())? {
                Some(ep) => ep,
                None => return Ok(()),
            }
        };
        let new_fd = accepted.handle();
        let peer = accepted.peer_addr();
        let mut old = {
            let s = self.registry.get_mut(id).ok_or(Error::NotFound(-1))?;
            s.swap_endpoint(side, accepted)
        };
        let old_fd = old.handle();
        self.poller.deregister(old_fd).ok();
        old.close();
        if let Err(err) = self
            .registry
            .reindex(id, old_fd, new_fd)
            .and_then(|()| self.poller.register(new_fd, Interest::Read))
        {
            // the old handle is already unmapped; recover through the id
            self.teardown(id, "data peer registration failed");
            return Err(err);
        }
        debug!("session {}: data peer {} connected on {} side", id, peer, side);
        self.refresh_interest(id);
        Ok(())
    }

    /// Keep write interest armed exactly while a handle has bytes waiting
    /// for it (its own queued bytes, or relay bytes buffered on the paired
    /// endpoint).
    fn refresh_interest(&mut self, id: SessionId) {
        let plan: Vec<_> = match self.registry.get(id) {
            None => return,
            Some(s) => [Side::Client, Side::Server]
                .into_iter()
                .filter(|side| !s.endpoint(*side).is_closed())
                .map(|side| {
                    let ep = s.endpoint(side);
                    let interest = if ep.is_listening() {
                        Interest::Read
                    } else {
                        // command-channel bytes travel through the pending
                        // queue; raw buffered bytes count only for data relay
                        let inbound = s.role == Role::Data
                            && !s.endpoint(side.other()).buffer().is_empty();
                        if ep.has_pending() || inbound {
                            Interest::ReadWrite
                        } else {
                            Interest::Read
                        }
                    };
                    (ep.handle(), interest)
                })
                .collect(),
        };
        for (fd, interest) in plan {
            self.poller.rearm(fd, interest).ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Instant;

    fn test_config(upstream: SocketAddr) -> GatewayConfig {
        let mut config = GatewayConfig::new("127.0.0.1".parse().unwrap(), 0, upstream);
        config.set_buffer_size(4096).set_backlog(8);
        config
    }

    fn spawn_gateway(upstream: SocketAddr) -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let mut server = Server::new(test_config(upstream)).unwrap();
        let addr = server.listen_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let th = thread::spawn(move || {
            server.serve(flag).unwrap();
        });
        (addr, running, th)
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => panic!("expected v4"),
        }
    }

    fn read_line(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        stream.read_line(&mut line).unwrap();
        line
    }

    fn endpoint_pair() -> (Endpoint, Endpoint) {
        let listener = Endpoint::listen("127.0.0.1:0".parse().unwrap(), 1, 64).unwrap();
        let addr = listener.local_addr().unwrap();
        let other = Endpoint::connect(addr, 64).unwrap();
        (listener, other)
    }

    #[test]
    fn command_teardown_cascades_to_children() {
        let mut server = Server::new(test_config("127.0.0.1:2121".parse().unwrap())).unwrap();

        let (c, s) = endpoint_pair();
        server.install(Session::command(SessionId(100), c, s)).unwrap();
        for child in [101, 102] {
            let (c, s) = endpoint_pair();
            server
                .install(Session::data(SessionId(child), SessionId(100), c, s))
                .unwrap();
            server
                .registry
                .get_mut(SessionId(100))
                .unwrap()
                .add_child(SessionId(child));
        }
        assert_eq!(server.registry.len(), 3);
        assert_eq!(server.registry.handle_count(), 6);

        server.teardown(SessionId(100), "test");
        assert!(server.registry.is_empty());
        assert_eq!(server.registry.handle_count(), 0);
    }

    #[test]
    fn server_shutdown_closes_everything() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let (addr, running, th) = spawn_gateway(upstream.local_addr().unwrap());

        let _client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(200));

        running.store(false, Ordering::Relaxed);
        th.join().unwrap();
    }

    #[test]
    fn command_channel_relays_both_directions() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let stub = thread::spawn(move || {
            let (conn, _) = upstream.accept().unwrap();
            let mut reader = BufReader::new(conn);
            reader
                .get_mut()
                .write_all(b"220 stub ready\r\n")
                .unwrap();
            let line = read_line(&mut reader);
            assert_eq!(line, "USER anonymous\r\n");
            reader.get_mut().write_all(b"331 ok\r\n").unwrap();
        });

        let (addr, running, th) = spawn_gateway(upstream_addr);
        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut client = BufReader::new(client);

        assert_eq!(read_line(&mut client), "220 stub ready\r\n");
        client.get_mut().write_all(b"USER anonymous\r\n").unwrap();
        assert_eq!(read_line(&mut client), "331 ok\r\n");

        stub.join().unwrap();
        running.store(false, Ordering::Relaxed);
        th.join().unwrap();
    }

    #[test]
    fn active_mode_negotiation_and_relay() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        // stub FTP server: greets, reads the rewritten PORT, connects to
        // the advertised (proxy) address, pushes bytes, echoes the upload
        let stub = thread::spawn(move || {
            let (conn, _) = upstream.accept().unwrap();
            let mut reader = BufReader::new(conn);
            reader.get_mut().write_all(b"220 stub ready\r\n").unwrap();

            let line = read_line(&mut reader);
            assert!(line.to_ascii_uppercase().starts_with("PORT "));
            let advertised = crate::command::parse_port_command(line.as_bytes()).unwrap();

            let mut data = TcpStream::connect(advertised).unwrap();
            data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            data.write_all(b"DATA123").unwrap();
            let mut got = [0u8; 6];
            data.read_exact(&mut got).unwrap();
            assert_eq!(&got, b"UPLOAD");
            drop(data);

            // command channel stays alive after the transfer
            let line = read_line(&mut reader);
            assert_eq!(line, "QUIT\r\n");
        });

        let (addr, running, th) = spawn_gateway(upstream_addr);
        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut client = BufReader::new(client);
        assert_eq!(read_line(&mut client), "220 stub ready\r\n");

        // client advertises its own data listener
        let client_data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let advertised = v4(client_data_listener.local_addr().unwrap());
        client
            .get_mut()
            .write_all(command::generate_port_command(advertised).as_bytes())
            .unwrap();

        // the gateway connects toward it and relays the stub's bytes
        let (mut data, _) = client_data_listener.accept().unwrap();
        data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut got = [0u8; 7];
        data.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"DATA123");
        data.write_all(b"UPLOAD").unwrap();

        client.get_mut().write_all(b"QUIT\r\n").unwrap();
        stub.join().unwrap();

        running.store(false, Ordering::Relaxed);
        th.join().unwrap();
    }

    #[test]
    fn data_bytes_sent_before_peer_connects_are_relayed() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        // stub FTP server: takes the rewritten PORT but connects late, after
        // the client has already pushed its upload
        let stub = thread::spawn(move || {
            let (conn, _) = upstream.accept().unwrap();
            let mut reader = BufReader::new(conn);
            reader.get_mut().write_all(b"220 stub ready\r\n").unwrap();

            let line = read_line(&mut reader);
            let advertised = crate::command::parse_port_command(line.as_bytes()).unwrap();

            thread::sleep(Duration::from_millis(300));
            let mut data = TcpStream::connect(advertised).unwrap();
            data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut got = [0u8; 7];
            data.read_exact(&mut got).unwrap();
            assert_eq!(&got, b"EARLY!!");
        });

        let (addr, running, th) = spawn_gateway(upstream_addr);
        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut client = BufReader::new(client);
        assert_eq!(read_line(&mut client), "220 stub ready\r\n");

        let client_data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let advertised = v4(client_data_listener.local_addr().unwrap());
        client
            .get_mut()
            .write_all(command::generate_port_command(advertised).as_bytes())
            .unwrap();

        // upload before the server side of the data channel exists
        let (mut data, _) = client_data_listener.accept().unwrap();
        data.write_all(b"EARLY!!").unwrap();

        stub.join().unwrap();
        running.store(false, Ordering::Relaxed);
        th.join().unwrap();
    }

    #[test]
    fn data_peer_swap_reindexes_and_teardown_clears() {
        let mut server = Server::new(test_config("127.0.0.1:2121".parse().unwrap())).unwrap();

        let data_listener = Endpoint::listen("127.0.0.1:0".parse().unwrap(), 1, 64).unwrap();
        let data_addr = data_listener.local_addr().unwrap();
        let (_anchor, upstream_end) = endpoint_pair();
        let id = SessionId(50);
        server
            .install(Session::data(id, SessionId(49), data_listener, upstream_end))
            .unwrap();
        let old_fd = server.registry.get(id).unwrap().endpoint(Side::Client).handle();

        let _peer = TcpStream::connect(data_addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            server.accept_data_peer(id, Side::Client).unwrap();
            if !server.registry.get(id).unwrap().endpoint(Side::Client).is_listening() {
                break;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        let new_fd = server.registry.get(id).unwrap().endpoint(Side::Client).handle();
        assert_ne!(new_fd, old_fd);
        assert_eq!(server.registry.id_of(new_fd).unwrap(), id);
        assert!(server.registry.id_of(old_fd).is_err());

        // removal works through the id alone, with the original handle gone
        server.teardown(id, "test");
        assert!(server.registry.is_empty());
        assert_eq!(server.registry.handle_count(), 0);
    }

    #[test]
    fn passive_mode_negotiation_and_relay() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let stub = thread::spawn(move || {
            let (conn, _) = upstream.accept().unwrap();
            let mut reader = BufReader::new(conn);
            reader.get_mut().write_all(b"220 stub ready\r\n").unwrap();

            let line = read_line(&mut reader);
            assert_eq!(line.trim_end(), "PASV");

            let data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let advertised = v4(data_listener.local_addr().unwrap());
            reader
                .get_mut()
                .write_all(crate::command::generate_pasv_reply(advertised).as_bytes())
                .unwrap();

            // the gateway connects toward the advertised address
            let (mut data, _) = data_listener.accept().unwrap();
            data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut got = [0u8; 8];
            data.read_exact(&mut got).unwrap();
            assert_eq!(&got, b"LISTING\n");
        });

        let (addr, running, th) = spawn_gateway(upstream_addr);
        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut client = BufReader::new(client);
        assert_eq!(read_line(&mut client), "220 stub ready\r\n");

        client.get_mut().write_all(b"PASV\r\n").unwrap();
        let reply = read_line(&mut client);
        let proxy_data = command::parse_pasv_reply(reply.as_bytes()).expect("rewritten 227");
        // the advertised address is the proxy's, not the stub's
        assert_ne!(SocketAddr::V4(proxy_data), upstream_addr);

        let mut data = TcpStream::connect(proxy_data).unwrap();
        data.write_all(b"LISTING\n").unwrap();
        drop(data);

        stub.join().unwrap();
        running.store(false, Ordering::Relaxed);
        th.join().unwrap();
    }

    #[test]
    fn closing_command_channel_cancels_data_sessions() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let stub = thread::spawn(move || {
            let (conn, _) = upstream.accept().unwrap();
            let mut reader = BufReader::new(conn);
            reader.get_mut().write_all(b"220 stub ready\r\n").unwrap();
            // swallow the two rewritten PORT lines, never connect
            let _ = read_line(&mut reader);
            let _ = read_line(&mut reader);
            // hold the connection until the gateway drops it
            let mut scratch = String::new();
            let _ = reader.read_line(&mut scratch);
        });

        let (addr, running, th) = spawn_gateway(upstream_addr);
        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut client = BufReader::new(client);
        assert_eq!(read_line(&mut client), "220 stub ready\r\n");

        // two in-flight data sessions for one command session
        let l1 = TcpListener::bind("127.0.0.1:0").unwrap();
        let l2 = TcpListener::bind("127.0.0.1:0").unwrap();
        for l in [&l1, &l2] {
            let advertised = v4(l.local_addr().unwrap());
            client
                .get_mut()
                .write_all(command::generate_port_command(advertised).as_bytes())
                .unwrap();
        }
        let (mut d1, _) = l1.accept().unwrap();
        let (mut d2, _) = l2.accept().unwrap();

        // dropping the command channel must cancel both data sessions
        drop(client);
        for d in [&mut d1, &mut d2] {
            d.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 1];
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match d.read(&mut buf) {
                    Ok(0) => break, // EOF: the gateway closed its side
                    Ok(_) => continue,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        panic!("data session outlived its command channel")
                    }
                    Err(_) => break, // reset also proves the close
                }
            }
            assert!(Instant::now() < deadline);
        }

        stub.join().unwrap();
        running.store(false, Ordering::Relaxed);
        th.join().unwrap();
    }
}

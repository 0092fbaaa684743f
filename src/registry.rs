use std::collections::HashMap;
use std::os::unix::io::RawFd;

use log::*;

use crate::error::{Error, Result};
use crate::session::{Session, SessionId};

/// All live sessions, addressable through either of their two socket
/// handles.
///
/// Invariant: every registered handle maps to exactly one live session, and
/// a removed session has both its endpoints closed before it is handed back.
/// The relay engine pairs every mutation here with the matching
/// readiness-set update in the same step.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_fd: HashMap<RawFd, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn handle_count(&self) -> usize {
        self.by_fd.len()
    }

    /// Insert a session, indexing both of its handles.
    ///
    /// Fails with `DuplicateHandle` when either handle is already
    /// registered; the registry is unchanged in that case.
    pub fn register(&mut self, session: Session) -> Result<()> {
        let [client_fd, server_fd] = session.handles();
        if self.by_fd.contains_key(&client_fd) || client_fd == server_fd {
            return Err(Error::DuplicateHandle(client_fd));
        }
        if self.by_fd.contains_key(&server_fd) {
            return Err(Error::DuplicateHandle(server_fd));
        }
        self.by_fd.insert(client_fd, session.id);
        self.by_fd.insert(server_fd, session.id);
        self.sessions.insert(session.id, session);
        Ok(())
    }

    /// Resolve a handle to its owning session id.
    pub fn id_of(&self, fd: RawFd) -> Result<SessionId> {
        self.by_fd.get(&fd).copied().ok_or(Error::NotFound(fd))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Re-index a session after one of its endpoints was swapped
    /// (listener replaced by the accepted connection).
    pub fn reindex(&mut self, id: SessionId, old_fd: RawFd, new_fd: RawFd) -> Result<()> {
        if self.by_fd.contains_key(&new_fd) {
            return Err(Error::DuplicateHandle(new_fd));
        }
        match self.by_fd.remove(&old_fd) {
            Some(found) if found == id => {
                self.by_fd.insert(new_fd, id);
                Ok(())
            }
            Some(found) => {
                // restore, then report: the handle belonged to someone else
                self.by_fd.insert(old_fd, found);
                Err(Error::NotFound(old_fd))
            }
            None => Err(Error::NotFound(old_fd)),
        }
    }

    /// Remove the session owning `fd`, deregistering both of its handles and
    /// closing both endpoints. Works through either handle.
    pub fn remove(&mut self, fd: RawFd) -> Result<Session> {
        let id = self.id_of(fd)?;
        self.remove_by_id(id)
    }

    pub fn remove_by_id(&mut self, id: SessionId) -> Result<Session> {
        let mut session = self
            .sessions
            .remove(&id)
            .ok_or(Error::NotFound(-1))?;
        for fd in session.handles() {
            self.by_fd.remove(&fd);
        }
        session.close();
        trace!("registry: removed {} ({} sessions live)", id, self.len());
        Ok(session)
    }

    /// Close and drain every session (process shutdown).
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_fd.clear();
        self.sessions
            .drain()
            .map(|(_, mut session)| {
                session.close();
                session
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::endpoint::Endpoint;

    fn stub_session(id: u64, client_fd: RawFd, server_fd: RawFd) -> Session {
        Session::command(
            SessionId(id),
            Endpoint::stub(client_fd),
            Endpoint::stub(server_fd),
        )
    }

    #[test]
    fn lookup_via_either_handle() {
        let mut registry = SessionRegistry::new();
        registry.register(stub_session(1, 10, 11)).unwrap();
        assert_eq!(registry.id_of(10).unwrap(), SessionId(1));
        assert_eq!(registry.id_of(11).unwrap(), SessionId(1));
        assert!(matches!(registry.id_of(12), Err(Error::NotFound(12))));
    }

    #[test]
    fn duplicate_handle_rejected_and_registry_unchanged() {
        let mut registry = SessionRegistry::new();
        registry.register(stub_session(1, 10, 11)).unwrap();
        let err = registry.register(stub_session(2, 11, 12)).unwrap_err();
        assert!(matches!(err, Error::DuplicateHandle(11)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handle_count(), 2);
        assert!(matches!(registry.id_of(12), Err(Error::NotFound(12))));
    }

    #[test]
    fn overlapping_client_and_server_handle_rejected() {
        let mut registry = SessionRegistry::new();
        let err = registry.register(stub_session(1, 10, 10)).unwrap_err();
        assert!(matches!(err, Error::DuplicateHandle(10)));
        assert!(registry.is_empty());
        assert_eq!(registry.handle_count(), 0);
    }

    #[test]
    fn remove_works_through_either_handle() {
        for fd in [10, 11] {
            let mut registry = SessionRegistry::new();
            registry.register(stub_session(1, 10, 11)).unwrap();
            let session = registry.remove(fd).unwrap();
            assert_eq!(session.id, SessionId(1));
            assert!(session.endpoint(crate::session::Side::Client).is_closed());
            assert!(session.endpoint(crate::session::Side::Server).is_closed());
            assert!(registry.is_empty());
            assert_eq!(registry.handle_count(), 0);
        }
    }

    #[test]
    fn remove_closes_real_endpoints() {
        let listener = Endpoint::listen("127.0.0.1:0".parse().unwrap(), 1, 64).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Endpoint::connect(addr, 64).unwrap();
        let fd = client.handle();

        let mut registry = SessionRegistry::new();
        registry
            .register(Session::command(SessionId(7), client, listener))
            .unwrap();
        let session = registry.remove(fd).unwrap();
        assert!(session.endpoint(crate::session::Side::Client).is_closed());
        assert!(session.endpoint(crate::session::Side::Server).is_closed());
    }

    #[test]
    fn reindex_moves_handle() {
        let mut registry = SessionRegistry::new();
        registry.register(stub_session(1, 10, 11)).unwrap();
        registry.reindex(SessionId(1), 11, 20).unwrap();
        assert_eq!(registry.id_of(20).unwrap(), SessionId(1));
        assert!(matches!(registry.id_of(11), Err(Error::NotFound(11))));
    }

    #[test]
    fn drain_empties_everything() {
        let mut registry = SessionRegistry::new();
        registry.register(stub_session(1, 10, 11)).unwrap();
        registry.register(stub_session(2, 12, 13)).unwrap();
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.handle_count(), 0);
    }
}

use std::os::unix::io::RawFd;
use std::time::Duration;

use log::*;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::error::Result;

const WAIT_CAPACITY: usize = 64;

/// I/O interest for a registered handle.
///
/// Every handle keeps read interest for its whole registered lifetime;
/// write interest is armed only while unsent bytes are queued for it, so a
/// level-triggered set does not spin on always-writable sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        let base = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        match self {
            Interest::Read => base,
            Interest::ReadWrite => base | EpollFlags::EPOLLOUT,
        }
    }
}

/// One ready handle reported by `Poller::wait`.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// peer hung up or the socket is in an error state
    pub hangup: bool,
}

/// The readiness-notification set: a thin, level-triggered epoll wrapper.
///
/// The contract is the generic one: register/rearm/deregister a handle for
/// read/write interest, wait with a timeout for at least one ready handle,
/// iterate the ready handles.
#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epfd })
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event)?;
        trace!("poll: fd {} added to readiness set ({:?})", fd, interest);
        Ok(())
    }

    pub fn rearm(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event)?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None)?;
        trace!("poll: fd {} removed from readiness set", fd);
        Ok(())
    }

    /// Wait for ready handles. An interrupted wait reports no handles,
    /// which the caller treats like a timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(isize::MAX as u128) as isize)
            .unwrap_or(-1);
        let mut events = [EpollEvent::empty(); WAIT_CAPACITY];
        let n = match epoll_wait(self.epfd, &mut events, timeout_ms) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(events[..n]
            .iter()
            .map(|ev| {
                let flags = ev.events();
                Readiness {
                    fd: ev.data() as RawFd,
                    readable: flags.contains(EpollFlags::EPOLLIN),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                    hangup: flags
                        .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
                }
            })
            .collect())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        nix::unistd::close(self.epfd).ok();
    }
}

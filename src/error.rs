use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {}", _0)]
    Io(#[from] io::Error),
    #[error("config error: {}", message)]
    Config { message: String },
    #[error("socket option error: {}", _0)]
    SocketOption(#[source] io::Error),
    #[error("set non-blocking failed: {}", _0)]
    NonBlocking(#[source] io::Error),
    #[error("connect failed: {}: {}", addr, source)]
    Connect {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("bind/listen failed: {}: {}", addr, source)]
    BindListen {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("malformed address in command: {:?}", payload)]
    MalformedAddress { payload: String },
    #[error("handle already registered: fd {}", _0)]
    DuplicateHandle(RawFd),
    #[error("no session for handle: fd {}", _0)]
    NotFound(RawFd),
    #[error("endpoint is closed")]
    Closed,
    #[error("readiness set error: {}", _0)]
    Poll(#[source] io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn malformed_address(payload: &[u8]) -> Self {
        Self::MalformedAddress {
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }

    pub fn connect(addr: SocketAddr, source: io::Error) -> Self {
        Self::Connect { addr, source }
    }

    pub fn bind_listen(addr: SocketAddr, source: io::Error) -> Self {
        Self::BindListen { addr, source }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Poll(io::Error::from_raw_os_error(err as i32))
    }
}

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Creating the epoll instance or the wake pipe failed.
    #[error("reactor setup failed: {0}")]
    Setup(#[source] nix::Error),

    /// `epoll_ctl` rejected a registration change.
    #[error("epoll_ctl({op}) failed for fd {fd}: {source}")]
    Register {
        fd: RawFd,
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Setup(errno) | Error::Register { source: errno, .. } => {
                io::Error::from_raw_os_error(errno as i32)
            }
            Error::Spawn(e) => e,
        }
    }
}

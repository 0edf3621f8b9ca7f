//! Thin owners around the epoll instance and the self-pipe used to interrupt
//! a blocked wait.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd;

pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> nix::Result<Self> {
        let fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { fd })
    }

    pub(crate) fn add(&self, fd: RawFd, flags: EpollFlags) -> nix::Result<()> {
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.fd, EpollOp::EpollCtlAdd, fd, &mut event)
    }

    pub(crate) fn modify(&self, fd: RawFd, flags: EpollFlags) -> nix::Result<()> {
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.fd, EpollOp::EpollCtlMod, fd, &mut event)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> nix::Result<()> {
        epoll_ctl(self.fd, EpollOp::EpollCtlDel, fd, None::<&mut EpollEvent>)
    }

    /// Wait up to `timeout_ms` (-1 forever). Interrupted waits count as zero
    /// events.
    pub(crate) fn wait(&self, events: &mut [EpollEvent], timeout_ms: isize) -> nix::Result<usize> {
        match epoll_wait(self.fd, events, timeout_ms) {
            Err(Errno::EINTR) => Ok(0),
            res => res,
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

pub(crate) struct WakePipe {
    read: RawFd,
    write: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> nix::Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self { read, write })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read
    }

    pub(crate) fn notify(&self) {
        match unistd::write(self.write, b"T") {
            // full pipe: a wake is already pending
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => log::error!("failed to write wake pipe: {}", e),
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 256];
        while let Ok(n) = unistd::read(self.read, &mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        let _ = unistd::close(self.read);
        let _ = unistd::close(self.write);
    }
}

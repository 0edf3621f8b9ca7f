//! Process-wide registry of what the hook layer knows about each descriptor.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, SFlag};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::reactor::Event;

const NO_TIMEOUT: u64 = u64::MAX;

static REGISTRY: Lazy<FdManager> = Lazy::new(FdManager::new);

/// Hook-layer view of one descriptor.
pub struct FdMeta {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    /// O_NONBLOCK was set by the runtime.
    sys_nonblock: bool,
    /// O_NONBLOCK as the user asked for it.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdMeta {
    fn new(fd: RawFd) -> Self {
        let mut meta = Self {
            fd,
            is_init: false,
            is_socket: false,
            sys_nonblock: false,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        };
        meta.init();
        meta
    }

    fn init(&mut self) {
        let stat = match fstat(self.fd) {
            Ok(stat) => stat,
            Err(e) => {
                log::debug!("fstat({}) failed: {}", self.fd, e);
                return;
            }
        };
        self.is_init = true;
        self.is_socket = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits())
            == SFlag::S_IFSOCK;
        if !self.is_socket {
            return;
        }

        let flags = match fcntl(self.fd, FcntlArg::F_GETFL) {
            Ok(bits) => OFlag::from_bits_truncate(bits),
            Err(e) => {
                log::warn!("F_GETFL on socket {} failed: {}", self.fd, e);
                return;
            }
        };
        self.user_nonblock
            .store(flags.contains(OFlag::O_NONBLOCK), Ordering::Relaxed);
        if !flags.contains(OFlag::O_NONBLOCK) {
            match fcntl(self.fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)) {
                Ok(_) => self.sys_nonblock = true,
                Err(e) => log::warn!("cannot make socket {} non-blocking: {}", self.fd, e),
            }
        } else {
            self.sys_nonblock = true;
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The descriptor was valid when first seen.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Timeout applied to blocking waits for `event`.
    pub fn timeout(&self, event: Event) -> Option<Duration> {
        let slot = match event {
            Event::Read => &self.recv_timeout,
            Event::Write => &self.send_timeout,
        };
        match slot.load(Ordering::Relaxed) {
            NO_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// `None` (or zero, as with `SO_RCVTIMEO`) waits forever.
    pub fn set_timeout(&self, event: Event, timeout: Option<Duration>) {
        let ms = match timeout {
            Some(t) if !t.is_zero() => t.as_millis().min(NO_TIMEOUT as u128 - 1) as u64,
            _ => NO_TIMEOUT,
        };
        let slot = match event {
            Event::Read => &self.recv_timeout,
            Event::Write => &self.send_timeout,
        };
        slot.store(ms, Ordering::Relaxed);
    }
}

impl fmt::Debug for FdMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdMeta")
            .field("fd", &self.fd)
            .field("is_socket", &self.is_socket)
            .field("sys_nonblock", &self.sys_nonblock)
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .field("recv_timeout", &self.timeout(Event::Read))
            .field("send_timeout", &self.timeout(Event::Write))
            .finish()
    }
}

/// 文件描述符元数据表
pub struct FdManager {
    metas: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl FdManager {
    fn new() -> Self {
        Self {
            metas: RwLock::new(vec![None; 64]),
        }
    }

    /// Metadata of `fd`, created on first touch when `auto_create` is set.
    pub fn get(fd: RawFd, auto_create: bool) -> Option<Arc<FdMeta>> {
        REGISTRY.lookup(fd, auto_create)
    }

    /// Forget `fd`. Returns whether it was known.
    pub fn remove(fd: RawFd) -> bool {
        REGISTRY.take(fd).is_some()
    }

    /// Replace whatever was recorded for `fd` with a fresh entry. Used for
    /// descriptors the runtime just created.
    pub(crate) fn fresh(fd: RawFd) -> Option<Arc<FdMeta>> {
        REGISTRY.take(fd);
        REGISTRY.lookup(fd, true)
    }

    fn lookup(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        if let Some(meta) = self.metas.read().get(idx).and_then(|m| m.clone()) {
            return Some(meta);
        }
        if !auto_create {
            return None;
        }

        let mut metas = self.metas.write();
        if idx >= metas.len() {
            metas.resize((idx * 3 / 2).max(idx + 1), None);
        }
        let meta = metas[idx].get_or_insert_with(|| Arc::new(FdMeta::new(fd)));
        Some(Arc::clone(meta))
    }

    fn take(&self, fd: RawFd) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        self.metas.write().get_mut(fd as usize)?.take()
    }
}

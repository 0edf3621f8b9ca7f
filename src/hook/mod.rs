//! Coroutine-aware wrappers around blocking socket and sleep calls.
//!
//! Every worker thread of a scheduler turns hooking on. There, a call on a
//! blocking-mode socket that would block parks the calling coroutine on the
//! reactor instead of the thread, honoring the socket's receive/send timeout.
//! Outside an io coroutine such a call blocks the thread in `poll(2)` instead,
//! as the plain syscall would have. With hooking off, on a non-socket
//! descriptor or on one the user made non-blocking, each wrapper is the plain
//! syscall.

mod fd_meta;

pub use fd_meta::{FdManager, FdMeta};

use std::cell::Cell;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_void, socklen_t};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self as nix_socket, sockopt, MsgFlags};
use nix::unistd;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config;
use crate::coroutine::{Coroutine, Wake};
use crate::reactor::{Event, IoManager};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

/// Turn hooking on or off for the calling thread.
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|h| h.set(on));
}

fn cvt<T>(res: nix::Result<T>) -> io::Result<T> {
    res.map_err(io::Error::from)
}

/// Metadata of `fd` if calls on it should be turned into coroutine waits.
fn hooked_meta(fd: RawFd) -> Option<Arc<FdMeta>> {
    if !is_enabled() {
        return None;
    }
    FdManager::get(fd, false)
}

/// Run `op` until it stops reporting `EINTR`/`EAGAIN`, parking the current
/// coroutine on `event` of `fd` in between.
fn do_io<T, F>(fd: RawFd, name: &'static str, event: Event, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let meta = match hooked_meta(fd) {
        Some(meta) => meta,
        None => return op(),
    };
    if meta.is_closed() {
        return Err(Errno::EBADF.into());
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return op();
    }

    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            res => return res,
        }
        wait_ready(fd, &meta, event, meta.timeout(event), name)?;
    }
}

/// Park the current coroutine until `fd` is ready for `event`, or block the
/// thread when not inside an io coroutine.
///
/// `Ok` means the caller should retry its call. Expiry of `timeout` gives
/// `TimedOut`, a cancelled wait `EBADF` when the descriptor got closed and
/// `ECANCELED` otherwise.
fn wait_ready(
    fd: RawFd,
    meta: &FdMeta,
    event: Event,
    timeout: Option<Duration>,
    name: &'static str,
) -> io::Result<()> {
    let (iom, co) = match (IoManager::current(), Coroutine::current()) {
        (Some(iom), Some(co)) => (iom, co),
        _ => return block_thread(fd, event, timeout, name),
    };

    iom.add_event(fd, event).map_err(|e| {
        log::error!("{}({}): cannot wait for {:?}: {}", name, fd, event, e);
        io::Error::from(e)
    })?;

    let expired = Arc::new(AtomicBool::new(false));
    let timer = timeout.map(|timeout| {
        let flag = Arc::downgrade(&expired);
        let sched = iom.downgrade();
        iom.add_condition_timer(
            timeout,
            move || {
                if let Some(flag) = flag.upgrade() {
                    flag.store(true, Ordering::Release);
                }
                if let Some(iom) = sched.upgrade().and_then(IoManager::from_scheduler) {
                    iom.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&expired),
            false,
        )
    });

    Coroutine::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    if expired.load(Ordering::Acquire) {
        log::debug!("{}({}) timed out after {:?}", name, fd, timeout);
        return Err(Errno::ETIMEDOUT.into());
    }
    match co.take_wake() {
        Some(Wake::Cancelled) if meta.is_closed() => Err(Errno::EBADF.into()),
        Some(Wake::Cancelled) => Err(Errno::ECANCELED.into()),
        _ => Ok(()),
    }
}

/// Wait for `fd` on the calling thread, for callers with no reactor to park on.
fn block_thread(
    fd: RawFd,
    event: Event,
    timeout: Option<Duration>,
    name: &'static str,
) -> io::Result<()> {
    log::trace!("{}({}) blocks its thread", name, fd);
    let flags = match event {
        Event::Read => PollFlags::POLLIN,
        Event::Write => PollFlags::POLLOUT,
    };
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Errno::ETIMEDOUT.into());
                }
                // round up so a sub-millisecond rest does not spin
                ((left.as_micros() + 999) / 1000).min(c_int::MAX as u128) as c_int
            }
            None => -1,
        };
        let mut fds = [PollFd::new(fd, flags)];
        match poll(&mut fds, wait) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Suspend the current coroutine for `dur`. Returns false when not running on
/// an io scheduler with hooking on.
fn park_for(dur: Duration) -> bool {
    if !is_enabled() {
        return false;
    }
    let (iom, co) = match (IoManager::current(), Coroutine::current()) {
        (Some(iom), Some(co)) => (iom, co),
        _ => return false,
    };
    let sched = iom.downgrade();
    iom.add_timer(
        dur,
        move || {
            if let Some(sched) = sched.upgrade() {
                sched.schedule_coroutine(co.clone());
            }
        },
        false,
    );
    Coroutine::yield_to_hold();
    true
}

pub fn sleep(secs: u64) {
    nanosleep(Duration::from_secs(secs));
}

pub fn usleep(usecs: u64) {
    nanosleep(Duration::from_micros(usecs));
}

pub fn nanosleep(dur: Duration) {
    if !park_for(dur) {
        thread::sleep(dur);
    }
}

/// Create a socket and start tracking it.
pub fn socket(domain: Domain, ty: Type, protocol: Option<Protocol>) -> io::Result<RawFd> {
    let fd = Socket::new(domain, ty, protocol)?.into_raw_fd();
    if is_enabled() {
        FdManager::fresh(fd);
    }
    Ok(fd)
}

/// Connect `fd` to `addr`, failing with `TimedOut` after `timeout`.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SockAddr,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let raw = || {
        let ret = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
        cvt(Errno::result(ret)).map(drop)
    };
    if !is_enabled() {
        return raw();
    }
    let meta = match FdManager::get(fd, false) {
        Some(meta) => meta,
        None => return raw(),
    };
    if meta.is_closed() {
        return Err(Errno::EBADF.into());
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return raw();
    }

    match raw() {
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        res => return res,
    }
    wait_ready(fd, &meta, Event::Write, timeout, "connect")?;

    match cvt(nix_socket::getsockopt(fd, sockopt::SocketError))? {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// [`connect_with_timeout`] with the configured connect timeout.
pub fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, config::get().connect_timeout)
}

pub fn accept(fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
    let (conn, addr) = do_io(fd, "accept", Event::Read, || unsafe {
        SockAddr::init(|storage, len| cvt(Errno::result(libc::accept(fd, storage.cast(), len))))
    })?;
    if is_enabled() {
        FdManager::fresh(conn);
    }
    Ok((conn, addr))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::Read, || cvt(unistd::read(fd, buf)))
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", Event::Read, || {
        let n = unsafe {
            libc::readv(
                fd,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len().min(c_int::MAX as usize) as c_int,
            )
        };
        cvt(Errno::result(n)).map(|n| n as usize)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: MsgFlags) -> io::Result<usize> {
    do_io(fd, "recv", Event::Read, || cvt(nix_socket::recv(fd, buf, flags)))
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: MsgFlags) -> io::Result<(usize, SockAddr)> {
    do_io(fd, "recvfrom", Event::Read, || unsafe {
        SockAddr::init(|storage, len| {
            let n = libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags.bits(),
                storage.cast(),
                len,
            );
            cvt(Errno::result(n)).map(|n| n as usize)
        })
    })
}

/// # Safety
///
/// `msg` must point to a valid `msghdr` whose buffers outlive the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: MsgFlags) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::Read, || {
        cvt(Errno::result(libc::recvmsg(fd, msg, flags.bits()))).map(|n| n as usize)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::Write, || cvt(unistd::write(fd, buf)))
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", Event::Write, || {
        let n = unsafe {
            libc::writev(
                fd,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len().min(c_int::MAX as usize) as c_int,
            )
        };
        cvt(Errno::result(n)).map(|n| n as usize)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: MsgFlags) -> io::Result<usize> {
    do_io(fd, "send", Event::Write, || cvt(nix_socket::send(fd, buf, flags)))
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: MsgFlags, addr: &SockAddr) -> io::Result<usize> {
    do_io(fd, "sendto", Event::Write, || {
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                buf.len(),
                flags.bits(),
                addr.as_ptr(),
                addr.len(),
            )
        };
        cvt(Errno::result(n)).map(|n| n as usize)
    })
}

/// # Safety
///
/// `msg` must point to a valid `msghdr` whose buffers outlive the call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: MsgFlags) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::Write, || {
        cvt(Errno::result(libc::sendmsg(fd, msg, flags.bits()))).map(|n| n as usize)
    })
}

/// Close `fd`, first waking everyone parked on it with `EBADF`.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(meta) = hooked_meta(fd) {
        meta.mark_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::remove(fd);
    }
    cvt(unistd::close(fd))
}

/// `fcntl` that keeps the runtime's O_NONBLOCK on tracked sockets while
/// reporting the user's view of it.
pub fn fcntl(fd: RawFd, arg: FcntlArg<'_>) -> io::Result<c_int> {
    let meta = hooked_meta(fd).filter(|m| !m.is_closed() && m.is_socket());
    match (arg, meta) {
        (FcntlArg::F_SETFL(flags), Some(meta)) => {
            meta.set_user_nonblock(flags.contains(OFlag::O_NONBLOCK));
            let flags = if meta.sys_nonblock() {
                flags | OFlag::O_NONBLOCK
            } else {
                flags & !OFlag::O_NONBLOCK
            };
            cvt(nix::fcntl::fcntl(fd, FcntlArg::F_SETFL(flags)))
        }
        (FcntlArg::F_GETFL, Some(meta)) => {
            let flags = OFlag::from_bits_truncate(cvt(nix::fcntl::fcntl(fd, FcntlArg::F_GETFL))?);
            let flags = if meta.user_nonblock() {
                flags | OFlag::O_NONBLOCK
            } else {
                flags & !OFlag::O_NONBLOCK
            };
            Ok(flags.bits())
        }
        (arg, _) => cvt(nix::fcntl::fcntl(fd, arg)),
    }
}

/// `ioctl` that records `FIONBIO` on tracked sockets as the user's view, while
/// the socket itself stays non-blocking.
///
/// # Safety
///
/// `arg` must be valid for `request`.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut c_void) -> io::Result<c_int> {
    if request == libc::FIONBIO as libc::c_ulong && !arg.is_null() {
        if let Some(meta) = hooked_meta(fd).filter(|m| !m.is_closed() && m.is_socket()) {
            meta.set_user_nonblock(*(arg as *const c_int) != 0);
            if meta.sys_nonblock() {
                let mut on: c_int = 1;
                let ret = libc::ioctl(fd, request as _, &mut on as *mut c_int);
                return cvt(Errno::result(ret));
            }
        }
    }
    cvt(Errno::result(libc::ioctl(fd, request as _, arg)))
}

/// # Safety
///
/// `value` and `len` must describe a buffer valid for the option.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> io::Result<()> {
    cvt(Errno::result(libc::getsockopt(fd, level, name, value, len))).map(drop)
}

/// `setsockopt` that also applies `SO_RCVTIMEO`/`SO_SNDTIMEO` to coroutine
/// waits on `fd`.
///
/// # Safety
///
/// `value` and `len` must describe a buffer valid for the option.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> io::Result<()> {
    let is_timeout = level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= mem::size_of::<libc::timeval>();
    if is_timeout {
        if let Some(meta) = hooked_meta(fd) {
            let tv = &*(value as *const libc::timeval);
            let timeout = Duration::from_secs(tv.tv_sec.max(0) as u64)
                + Duration::from_micros(tv.tv_usec.max(0) as u64);
            let event = if name == libc::SO_RCVTIMEO {
                Event::Read
            } else {
                Event::Write
            };
            meta.set_timeout(event, Some(timeout));
        }
    }
    cvt(Errno::result(libc::setsockopt(fd, level, name, value, len))).map(drop)
}

/// Set the receive (`Event::Read`) or send timeout of `fd` through
/// [`setsockopt`].
pub fn set_timeout(fd: RawFd, event: Event, timeout: Option<Duration>) -> io::Result<()> {
    let timeout = timeout.unwrap_or(Duration::ZERO);
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let name = match event {
        Event::Read => libc::SO_RCVTIMEO,
        Event::Write => libc::SO_SNDTIMEO,
    };
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            (&tv as *const libc::timeval).cast(),
            mem::size_of::<libc::timeval>() as socklen_t,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        assert!(!is_enabled());
        set_enabled(true);
        assert!(is_enabled());
        set_enabled(false);
    }

    #[test]
    fn plain_calls_without_hooking() {
        let (r, w) = unistd::pipe().unwrap();
        assert_eq!(write(w, b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(r, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        close(r).unwrap();
        close(w).unwrap();
    }

    #[test]
    fn sleep_falls_back_to_the_thread() {
        let start = std::time::Instant::now();
        usleep(20_000);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}

//! Bridging process signals to a cancellation pipe.
//!
//! While a start request supervises a launcher child, SIGINT/SIGHUP/SIGTERM
//! must turn into an interrupt of that child rather than kill the daemon.
//! The handler runs in signal context, so the only shared state is a single
//! atomic slot holding the pipe's write end with two sentinels:
//!
//! - `CLOSED_FD`: no handler armed; whoever observes this while holding the
//!   fd must close it.
//! - `IN_USE_FD`: the handler is currently writing through the fd.
//!
//! The handler swaps the slot to `IN_USE_FD`, writes the signal number,
//! and swaps the fd back; if teardown ran in between, the handler closes
//! the fd itself. Teardown swaps to `CLOSED_FD` and closes the fd only when
//! the handler is not mid-execution. No fd leaks, no write-after-close,
//! regardless of signal timing.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::{Error, Result};

const CLOSED_FD: i32 = -1;
const IN_USE_FD: i32 = -2;

const BRIDGED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM];

static SIGNAL_PIPE_WRITE_END: AtomicI32 = AtomicI32::new(CLOSED_FD);

extern "C" fn interrupt_handler(signal: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE_END.swap(IN_USE_FD, Ordering::SeqCst);
    if fd >= 0 {
        let payload = signal;
        // Result intentionally ignored; the pipe is non-blocking.
        unsafe {
            libc::write(
                fd,
                &payload as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>(),
            );
        }
    }
    let observed = SIGNAL_PIPE_WRITE_END.swap(fd, Ordering::SeqCst);
    if observed != IN_USE_FD {
        // Teardown ran while the handler held the slot; the fd is ours to
        // close now.
        let fd = SIGNAL_PIPE_WRITE_END.swap(CLOSED_FD, Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// An armed signal bridge. At most one may exist process-wide.
pub struct SignalBridge {
    read_fd: RawFd,
    armed: bool,
}

impl SignalBridge {
    /// Install the handlers and hand back the bridge. The caller reads the
    /// signal pipe from [`SignalBridge::read_fd`]; each delivered signal
    /// writes one `c_int` to it, and disarming closes the write end so the
    /// reader observes EOF.
    pub fn arm() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        // The handler must never block in signal context.
        unsafe {
            let flags = libc::fcntl(write_fd, libc::F_GETFL, 0);
            libc::fcntl(write_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        if SIGNAL_PIPE_WRITE_END
            .compare_exchange(CLOSED_FD, write_fd, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(Error::internal("signal bridge is already armed"));
        }

        let action = SigAction::new(
            SigHandler::Handler(interrupt_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in BRIDGED_SIGNALS {
            if let Err(errno) = unsafe { sigaction(signal, &action) } {
                Self::teardown();
                unsafe {
                    libc::close(read_fd);
                }
                return Err(Error::internal(format!(
                    "failed to install {} handler: {}",
                    signal, errno
                )));
            }
        }

        debug!("signal bridge armed");
        Ok(Self {
            read_fd,
            armed: true,
        })
    }

    /// The read end of the signal pipe. Ownership passes to the caller's
    /// reader, which must close it (EOF arrives once the bridge disarms).
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Restore default handlers and close the write end of the pipe.
    pub fn disarm(mut self) {
        self.disarm_inner();
    }

    fn disarm_inner(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        Self::teardown();
        debug!("signal bridge disarmed");
    }

    fn teardown() {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for signal in BRIDGED_SIGNALS {
            let _ = unsafe { sigaction(signal, &default) };
        }
        let fd = SIGNAL_PIPE_WRITE_END.swap(CLOSED_FD, Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
        // A negative fd means the handler is executing; it will close the
        // write end itself when it observes CLOSED_FD.
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.disarm_inner();
    }
}

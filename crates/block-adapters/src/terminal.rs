//! Terminal foreground handoff for interactive stages.
//!
//! Full-screen stage programs must own the terminal foreground, otherwise the
//! line discipline stops them the first time they touch the terminal. The
//! child does the work itself between fork and exec:
//!
//! 1. `setpgid(0, 0)` so it leads a fresh process group
//! 2. ignore SIGTTOU, since `tcsetpgrp` from a background group raises it
//! 3. open `/dev/tty`
//! 4. make its group the terminal's foreground group
//! 5. restore the previous SIGTTOU disposition, on every path
//!
//! [`ForegroundLease`] wraps this for the parent: it checks a controlling
//! terminal exists before anything is spawned, and hands the foreground back
//! to whichever group held it once the stage is over.

// Installing the hook and changing signal dispositions are unsafe calls.
#![allow(unsafe_code)]

use block_core::BlockError;
use nix::fcntl::{OFlag, open};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, getpgrp, setpgid, tcgetpgrp, tcsetpgrp};
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use tokio::process::Command;
use tracing::{debug, warn};

const TTY_PATH: &CStr = c"/dev/tty";

fn open_tty() -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open("/dev/tty")
}

/// Opens this process's controlling terminal.
///
/// Fails with `NoControllingTerminal` on headless runs.
pub fn controlling_terminal() -> Result<File, BlockError> {
    open_tty().map_err(|source| BlockError::NoControllingTerminal { source })
}

/// Runs `f` with SIGTTOU ignored.
///
/// The previous disposition is restored before returning, whether `f`
/// succeeds or fails. Does not allocate, so it is usable after fork.
pub fn with_sigttou_ignored<T>(f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    // SAFETY: SIG_IGN runs no handler code.
    let previous = unsafe { signal(Signal::SIGTTOU, SigHandler::SigIgn) }?;
    let _restore = scopeguard::guard(previous, |handler| {
        // SAFETY: reinstalls exactly the disposition that was replaced above.
        let _ = unsafe { signal(Signal::SIGTTOU, handler) };
    });
    f()
}

/// Child side of the handoff. Runs after fork, before exec.
fn acquire_foreground() -> io::Result<()> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    with_sigttou_ignored(|| {
        let fd = open(TTY_PATH, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())?;
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        let tty = unsafe { OwnedFd::from_raw_fd(fd) };
        tcsetpgrp(&tty, getpgrp())?;
        Ok(())
    })
}

/// Makes the child spawned from `command` take the terminal foreground.
pub fn hand_off_foreground(command: &mut Command) {
    // SAFETY: `acquire_foreground` only calls setpgid, sigaction, open,
    // tcsetpgrp and close, all async-signal-safe, and never allocates.
    unsafe {
        command.pre_exec(acquire_foreground);
    }
}

/// Gives the terminal foreground back to `group`.
pub fn reclaim_foreground(group: Pid) -> io::Result<()> {
    let tty = open_tty()?;
    with_sigttou_ignored(|| tcsetpgrp(&tty, group).map_err(io::Error::from))
}

/// Terminal foreground lent to one stage.
///
/// Dropping the lease returns the foreground to the group that held it when
/// the lease was taken. Failing to do so is logged, never fatal.
#[derive(Debug)]
pub struct ForegroundLease {
    previous: Pid,
}

impl ForegroundLease {
    /// Arranges for `command`'s child to take the foreground.
    pub fn acquire(command: &mut Command) -> Result<Self, BlockError> {
        let tty = controlling_terminal()?;
        let previous = tcgetpgrp(&tty).map_err(|errno| BlockError::NoControllingTerminal {
            source: io::Error::from(errno),
        })?;
        hand_off_foreground(command);
        debug!(%previous, "Terminal foreground handoff armed");
        Ok(Self { previous })
    }
}

impl Drop for ForegroundLease {
    fn drop(&mut self) {
        match reclaim_foreground(self.previous) {
            Ok(()) => debug!(group = %self.previous, "Terminal foreground reclaimed"),
            Err(err) => warn!(group = %self.previous, "Could not reclaim terminal foreground: {}", err),
        }
    }
}

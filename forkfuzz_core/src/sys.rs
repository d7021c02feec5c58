//! Thin wrappers over the libc process and pipe primitives the executor
//! needs.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub type Pid = libc::pid_t;

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Signaled(i32),
}

pub enum Fork {
    Parent(Pid),
    Child,
}

/// Signals whose default action terminates the process with a fault.
const FATAL_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
];

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Creates a unidirectional close-on-exec pipe, returning
/// `(read_end, write_end)`.
pub fn pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: `fds` is a valid buffer for two descriptors.
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: pipe2(2) succeeded, so both descriptors are fresh and owned by us.
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Forks the calling process.
///
/// # Safety
/// In a multi-threaded parent only the calling thread survives in the child.
/// The child must not rely on locks other threads may have held at the time
/// of the fork, and must leave through [`exit_immediately`] so that no
/// parent-owned destructors run twice.
pub unsafe fn fork() -> io::Result<Fork> {
    // SAFETY: upheld by the caller.
    match cvt(unsafe { libc::fork() })? {
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

/// Waits up to `timeout` for any of `fds` to become readable or hang up.
/// Returns one flag per descriptor. An interrupted wait reports nothing ready.
pub fn poll_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `pollfds` is a valid, correctly sized array of pollfd structs.
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }
    let ready_mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    Ok(pollfds
        .iter()
        .map(|p| p.revents & ready_mask != 0)
        .collect())
}

fn decode_wait_status(status: libc::c_int) -> io::Result<WaitStatus> {
    if libc::WIFEXITED(status) {
        Ok(WaitStatus::Exited(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Ok(WaitStatus::Signaled(libc::WTERMSIG(status)))
    } else {
        Err(io::Error::other(format!(
            "unexpected wait status {status:#x}"
        )))
    }
}

fn waitpid(pid: Pid, flags: libc::c_int) -> io::Result<Option<WaitStatus>> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            0 => return Ok(None),
            _ => return decode_wait_status(status).map(Some),
        }
    }
}

/// Reaps `pid` if it has terminated, without blocking.
pub fn try_wait(pid: Pid) -> io::Result<Option<WaitStatus>> {
    waitpid(pid, libc::WNOHANG)
}

/// Blocks until `pid` terminates and reaps it.
pub fn wait_blocking(pid: Pid) -> io::Result<WaitStatus> {
    waitpid(pid, 0)?.ok_or_else(|| io::Error::other(format!("waitpid({pid}) returned no status")))
}

/// Sends `signal` to `pid`. A process that is already gone is not an error.
pub fn kill(pid: Pid, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers.
    if unsafe { libc::kill(pid, signal) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

pub fn current_pid() -> Pid {
    // SAFETY: getpid(2) cannot fail.
    unsafe { libc::getpid() }
}

/// Restores the default action for fault signals so that a faulting child
/// actually dies and its parent can observe the signal.
pub fn reset_fatal_signals() {
    for signal in FATAL_SIGNALS {
        // SAFETY: installing SIG_DFL is always valid for these signals.
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
}

pub fn ignore_interrupts() {
    // SAFETY: installing SIG_IGN for SIGINT is always valid.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // SAFETY: signal(2) is async-signal-safe; SIG_DFL is valid for SIGINT.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Routes the first SIGINT to a process-wide flag readable through
/// [`interrupted`]. A second SIGINT gets the default action and terminates
/// the process.
pub fn install_interrupt_flag() -> io::Result<()> {
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    // SAFETY: the handler only performs an atomic store, which is async-signal-safe.
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Terminates the calling process without running atexit handlers or
/// flushing buffers inherited from the parent.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit(2) never returns and touches no Rust state.
    unsafe { libc::_exit(code) }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSYS => "SIGSYS",
        _ => "unknown signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_carries_bytes() {
        let (mut rx, mut tx) = pipe().unwrap();
        tx.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn poll_sees_data_and_hangup() {
        let (rx, mut tx) = pipe().unwrap();
        let fds = [rx.as_raw_fd()];
        assert_eq!(poll_readable(&fds, Duration::ZERO).unwrap(), [false]);
        tx.write_all(b"x").unwrap();
        assert_eq!(poll_readable(&fds, Duration::ZERO).unwrap(), [true]);

        let (rx2, tx2) = pipe().unwrap();
        drop(tx2);
        assert_eq!(
            poll_readable(&[rx2.as_raw_fd()], Duration::from_secs(1)).unwrap(),
            [true]
        );
    }

    #[test]
    fn child_exit_code_and_signal_are_classified() {
        // SAFETY: the child only calls async-signal-safe functions before _exit.
        let pid = match unsafe { fork() }.unwrap() {
            Fork::Child => exit_immediately(7),
            Fork::Parent(pid) => pid,
        };
        assert_eq!(wait_blocking(pid).unwrap(), WaitStatus::Exited(7));

        // SAFETY: as above.
        let pid = match unsafe { fork() }.unwrap() {
            Fork::Child => {
                // SAFETY: pause(2) has no preconditions.
                unsafe { libc::pause() };
                exit_immediately(0)
            }
            Fork::Parent(pid) => pid,
        };
        kill(pid, libc::SIGKILL).unwrap();
        assert_eq!(
            wait_blocking(pid).unwrap(),
            WaitStatus::Signaled(libc::SIGKILL)
        );
    }

    #[test]
    fn try_wait_on_running_child_is_none() {
        // SAFETY: as above.
        let pid = match unsafe { fork() }.unwrap() {
            Fork::Child => {
                // SAFETY: pause(2) has no preconditions.
                unsafe { libc::pause() };
                exit_immediately(0)
            }
            Fork::Parent(pid) => pid,
        };
        assert_eq!(try_wait(pid).unwrap(), None);
        kill(pid, libc::SIGTERM).unwrap();
        assert_eq!(
            wait_blocking(pid).unwrap(),
            WaitStatus::Signaled(libc::SIGTERM)
        );
    }

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let (rx, tx) = pipe().unwrap();
        for fd in [rx.as_raw_fd(), tx.as_raw_fd()] {
            // SAFETY: F_GETFD on a descriptor owned by this test.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn second_interrupt_terminates() {
        // SAFETY: the child only installs handlers and raises signals before _exit.
        let pid = match unsafe { fork() }.unwrap() {
            Fork::Child => {
                if install_interrupt_flag().is_err() {
                    exit_immediately(10);
                }
                // SAFETY: raise(3) takes a plain signal number.
                unsafe { libc::raise(libc::SIGINT) };
                if !interrupted() {
                    exit_immediately(11);
                }
                // SAFETY: as above.
                unsafe { libc::raise(libc::SIGINT) };
                exit_immediately(12)
            }
            Fork::Parent(pid) => pid,
        };
        assert_eq!(
            wait_blocking(pid).unwrap(),
            WaitStatus::Signaled(libc::SIGINT)
        );
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(libc::SIGABRT), "SIGABRT");
        assert_eq!(signal_name(0), "unknown signal");
    }
}

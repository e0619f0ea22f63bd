//! Thin, typed wrappers around the POSIX process-supervision primitives the
//! kernel needs: fork, exec, non-blocking waitpid, process-group signaling,
//! and the child-side rlimit/chdir setup. Each function wraps exactly one
//! syscall and returns `std::io::Result`, in the same style as a safe
//! syscall façade wraps `libc::syscall`/`libc::ioctl` elsewhere in this
//! crate's ancestry — no raw `pid_t`/`c_int` leaks past this module.

use std::ffi::CString;
use std::io::{Error, Result};

/// Outcome of a successful `fork(2)`.
pub enum ForkResult {
    Parent { child_pid: i32 },
    Child,
}

/// Forks the current process.
///
/// # Safety
///
/// Between this call returning `ForkResult::Child` and the child's eventual
/// `exec_shell` or exit, only async-signal-safe operations may run: no
/// logging, no `std::process::exit` (it runs atexit handlers and flushes
/// C stdio), nothing that can block on a lock some other thread in the
/// parent held at the instant of `fork()`. A child that falls through
/// `exec_shell` (i.e. exec failed) must terminate with `libc::_exit`, not
/// `std::process::exit`. The caller is responsible for keeping this
/// window narrow and signal-safe throughout.
pub unsafe fn fork() -> Result<ForkResult> {
    let pid = libc::fork();
    if pid < 0 {
        return Err(Error::last_os_error());
    }
    if pid == 0 {
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent { child_pid: pid })
    }
}

/// `setpgid(0, 0)`: makes the calling process its own process group leader.
pub fn setpgid_self() -> Result<()> {
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Sets both the soft and hard `RLIMIT_NOFILE` to `n`.
pub fn set_rlimit_nofile(n: u64) -> Result<()> {
    let rl = libc::rlimit {
        rlim_cur: n as libc::rlim_t,
        rlim_max: n as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Zeroes `RLIMIT_CORE`, disabling core dumps for this process.
pub fn disable_core_dump() -> Result<()> {
    let rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rl) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// `chdir(path)`.
pub fn chdir(path: &str) -> Result<()> {
    let c_path = CString::new(path).map_err(|_| Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::chdir(c_path.as_ptr()) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// `execl("/bin/sh", "sh", "-c", cmd, NULL)`. Only returns on failure — the
/// call replaces the current process image on success.
pub fn exec_shell(cmd: &str) -> Error {
    let shell = CString::new("/bin/sh").unwrap();
    let flag = CString::new("-c").unwrap();
    let cmd = match CString::new(cmd) {
        Ok(c) => c,
        Err(_) => return Error::from(std::io::ErrorKind::InvalidInput),
    };
    unsafe {
        libc::execl(
            shell.as_ptr(),
            shell.as_ptr(),
            flag.as_ptr(),
            cmd.as_ptr(),
            std::ptr::null::<libc::c_char>(),
        );
    }
    Error::last_os_error()
}

/// Sends `sig` to the process group led by `pgid` (i.e. `kill(-pgid, sig)`),
/// so that shell descendants are signaled along with the shell itself.
pub fn kill_process_group(pgid: i32, sig: i32) -> Result<()> {
    if unsafe { libc::kill(-pgid, sig) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

/// Non-blocking `waitpid(pid, ..., WNOHANG)`. Returns `Ok(None)` if the
/// child has not yet exited.
pub fn waitpid_nonblocking(pid: i32) -> Result<Option<ExitOutcome>> {
    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    if ret == 0 {
        return Ok(None);
    }
    if libc::WIFEXITED(status) {
        Ok(Some(ExitOutcome::Exited(libc::WEXITSTATUS(status))))
    } else {
        Ok(Some(ExitOutcome::Signaled(libc::WTERMSIG(status))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_exec_wait_round_trip_for_success() {
        // This spawns a real child, exercising the whole façade end to end.
        let pid = unsafe {
            match fork().unwrap() {
                ForkResult::Child => {
                    let _ = setpgid_self();
                    let err = exec_shell("exit 0");
                    eprintln!("exec failed: {err}");
                    std::process::exit(127);
                }
                ForkResult::Parent { child_pid } => child_pid,
            }
        };

        let mut outcome = None;
        for _ in 0..200 {
            if let Some(o) = waitpid_nonblocking(pid).unwrap() {
                outcome = Some(o);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(outcome, Some(ExitOutcome::Exited(0)));
    }

    #[test]
    fn kill_process_group_terminates_child() {
        let pid = unsafe {
            match fork().unwrap() {
                ForkResult::Child => {
                    let _ = setpgid_self();
                    let err = exec_shell("sleep 30");
                    eprintln!("exec failed: {err}");
                    std::process::exit(127);
                }
                ForkResult::Parent { child_pid } => child_pid,
            }
        };

        // Give the child a moment to call setpgid(0, 0) before targeting its
        // process group — otherwise the signal can race the group change.
        std::thread::sleep(std::time::Duration::from_millis(20));
        kill_process_group(pid, libc::SIGKILL).unwrap();

        let mut outcome = None;
        for _ in 0..200 {
            if let Some(o) = waitpid_nonblocking(pid).unwrap() {
                outcome = Some(o);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(outcome, Some(ExitOutcome::Signaled(libc::SIGKILL)));
    }
}

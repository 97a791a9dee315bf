//! Platform adapter: CPU topology, affinity and real-time capability.
//!
//! All operations act on the calling thread. On non-Linux targets the
//! affinity calls are no-ops and the capability probe reports failure, so
//! the runtime degrades to ordinary scheduling.

use crate::error::{Error, Result};

/// Number of online CPUs.
#[cfg(target_os = "linux")]
pub fn num_cores() -> Result<usize> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        return Err(Error::Fail);
    }
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
pub fn num_cores() -> Result<usize> {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .map_err(|_| Error::Fail)
}

/// Whether the process may move threads into a real-time scheduling class.
///
/// True for euid 0, or when the RLIMIT_RTPRIO soft limit admits at least
/// priority 1.
#[cfg(target_os = "linux")]
pub fn can_set_exclusive() -> Result<bool> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(true);
    }
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let res = unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut lim) };
    if res != 0 {
        return Err(Error::Fail);
    }
    Ok(lim.rlim_cur >= 1)
}

#[cfg(not(target_os = "linux"))]
pub fn can_set_exclusive() -> Result<bool> {
    Err(Error::Fail)
}

/// Bind the calling thread's affinity mask to the given cores.
#[cfg(target_os = "linux")]
pub(crate) fn pin_to(cores: &[usize]) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &core in cores {
            libc::CPU_SET(core, &mut set);
        }
        // pid 0 addresses the calling thread
        let res = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if res != 0 {
            return Err(Error::Assign);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_to(_cores: &[usize]) -> Result<()> {
    Ok(())
}

/// Move the calling thread into the SCHED_FIFO class at the lowest
/// real-time priority. Callers treat a failure as best-effort.
#[cfg(target_os = "linux")]
pub(crate) fn request_exclusive() -> Result<()> {
    let param = libc::sched_param { sched_priority: 1 };
    let res = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if res != 0 {
        return Err(Error::Excl);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn request_exclusive() -> Result<()> {
    Err(Error::Excl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_cores_positive() {
        assert!(num_cores().unwrap() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_to_online_core() {
        // Core 0 is always online; pinning the test thread to it must work.
        pin_to(&[0]).unwrap();
        // Re-widen to all cores so later tests are unaffected.
        let all: Vec<usize> = (0..num_cores().unwrap()).collect();
        pin_to(&all).unwrap();
    }
}

//! Runtime configuration, captured once at `Lpel::init` and read-only
//! afterwards.

use std::ops::BitOr;

use crate::error::{Error, Result};
use crate::platform;

/// Behaviour flags for the worker pool.
///
/// `PINNED` binds each worker to a fixed CPU. `EXCLUSIVE` additionally moves
/// the pinned workers into a real-time scheduling class and is only valid
/// together with `PINNED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const PINNED: Flags = Flags(1 << 0);
    pub const EXCLUSIVE: Flags = Flags(1 << 1);

    /// Check whether all bits of `other` are set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Names the log files of the monitoring subsystem.
///
/// A worker's log file is `<prefix><name><postfix>`. Prefix and postfix are
/// truncated to 16 characters, names to 31.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub prefix: String,
    pub postfix: String,
}

/// Runtime configuration.
///
/// `num_workers` task-serving kernel threads are multiplexed over
/// `proc_workers` physical CPUs; `proc_others` CPUs are reserved for
/// non-worker threads (0 shares the worker CPUs). `node` is an opaque
/// identifier handed through to the workers.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_workers: usize,
    pub proc_workers: usize,
    pub proc_others: usize,
    pub flags: Flags,
    pub node: i32,
    /// Enables the monitoring subsystem when set.
    pub monitoring: Option<MonitorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_workers: 1,
            proc_workers: 1,
            proc_others: 0,
            flags: Flags::NONE,
            node: -1,
            monitoring: None,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// Checked in order: basic sanity, core-count fit (only when the number
    /// of cores can be probed), `EXCLUSIVE` implies `PINNED`, and finally the
    /// real-time capability when `EXCLUSIVE` is requested. A failing
    /// capability probe is ignored; a successful probe with a negative
    /// answer yields `Error::Excl`.
    pub fn check(&self) -> Result<()> {
        if self.num_workers == 0 || self.proc_workers == 0 {
            return Err(Error::Inval);
        }

        if let Ok(avail) = platform::num_cores() {
            if self.proc_workers + self.proc_others > avail {
                return Err(Error::Inval);
            }
        }

        if self.flags.contains(Flags::EXCLUSIVE) {
            if !self.flags.contains(Flags::PINNED) {
                return Err(Error::Inval);
            }
            if let Ok(can_rt) = platform::can_set_exclusive() {
                if !can_rt {
                    return Err(Error::Excl);
                }
            }
        }

        Ok(())
    }

    /// CPU set for worker threads: cores `[0, proc_workers)`.
    pub(crate) fn cpuset_workers(&self) -> Vec<usize> {
        (0..self.proc_workers).collect()
    }

    /// CPU set for non-worker threads.
    ///
    /// `proc_others == 0` distributes the others over the worker cores,
    /// otherwise they get the `proc_others` cores following the worker cores.
    pub(crate) fn cpuset_others(&self) -> Vec<usize> {
        if self.proc_others == 0 {
            (0..self.proc_workers).collect()
        } else {
            (self.proc_workers..self.proc_workers + self.proc_others).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_contains() {
        let f = Flags::PINNED | Flags::EXCLUSIVE;
        assert!(f.contains(Flags::PINNED));
        assert!(f.contains(Flags::EXCLUSIVE));
        assert!(!Flags::PINNED.contains(Flags::EXCLUSIVE));
        assert!(f.contains(Flags::NONE));
    }

    #[test]
    fn test_check_rejects_zero_workers() {
        let cfg = Config {
            num_workers: 0,
            ..Config::default()
        };
        assert_eq!(cfg.check(), Err(Error::Inval));

        let cfg = Config {
            proc_workers: 0,
            ..Config::default()
        };
        assert_eq!(cfg.check(), Err(Error::Inval));
    }

    #[test]
    fn test_check_rejects_exclusive_without_pinned() {
        let cfg = Config {
            flags: Flags::EXCLUSIVE,
            ..Config::default()
        };
        assert_eq!(cfg.check(), Err(Error::Inval));
    }

    #[test]
    fn test_check_rejects_oversubscription() {
        // More CPUs than any machine running this test will have online.
        let cfg = Config {
            proc_workers: 4096,
            proc_others: 4096,
            ..Config::default()
        };
        assert_eq!(cfg.check(), Err(Error::Inval));
    }

    #[test]
    fn test_cpuset_others_shares_worker_cores_when_zero() {
        let cfg = Config {
            num_workers: 2,
            proc_workers: 2,
            proc_others: 0,
            ..Config::default()
        };
        assert_eq!(cfg.cpuset_workers(), vec![0, 1]);
        assert_eq!(cfg.cpuset_others(), vec![0, 1]);
    }

    #[test]
    fn test_cpuset_others_follows_worker_cores() {
        let cfg = Config {
            num_workers: 2,
            proc_workers: 2,
            proc_others: 2,
            ..Config::default()
        };
        assert_eq!(cfg.cpuset_others(), vec![2, 3]);
    }
}

//! Per-process scheduler options.
//!
//! Options arrive as `name[=value]` pairs when an HPC process is set up.
//! [`LwkOptions::apply`] parses one pair; unknown names are reported with
//! [`SchedError::UnknownOption`] so the caller can try other consumers.

use crate::commit::CommitScope;
use crate::error::SchedError;
use crate::thread::HZ;

/// Shortest accepted round-robin time slice, in milliseconds.
pub const MIN_RR_MSECS: u32 = 1000 / HZ;

/// How many general-purpose CPUs a utility thread may be spread over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UtilCpuPolicy {
    /// Every matching general-purpose CPU.
    #[default]
    Many,
    /// Exactly one, the least committed.
    One,
}

/// Scheduler options of one HPC process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwkOptions {
    /// Round-robin time slice in ticks; `None` runs threads FIFO.
    pub rr_slice: Option<u32>,
    /// Reserved CPUs (from the end of the sequence) open to utility
    /// threads; `None` means all of them.
    pub max_cpus_for_util: Option<usize>,
    /// Utility threads allowed per reserved CPU; `None` means unlimited.
    pub max_util_threads_per_cpu: Option<u32>,
    /// Commitments counted when comparing CPUs for utility placement.
    pub overcommit: CommitScope,
    /// General-purpose CPU policy for utility threads.
    pub util_cpus: UtilCpuPolicy,
    /// errno returned by affinity changes; `None` allows them.
    pub disable_setaffinity: Option<i32>,
    /// Statistics verbosity.
    pub stats_level: u32,
    /// Number of leading thread creations treated as utility threads.
    pub util_threads: u32,
    /// System-call migration to general-purpose CPUs is disabled.
    pub move_syscalls_disable: bool,
}

impl Default for LwkOptions {
    fn default() -> Self {
        Self {
            rr_slice: None,
            max_cpus_for_util: None,
            max_util_threads_per_cpu: Some(1),
            overcommit: CommitScope::UtilityOnly,
            util_cpus: UtilCpuPolicy::Many,
            disable_setaffinity: None,
            stats_level: 0,
            util_threads: 0,
            move_syscalls_disable: false,
        }
    }
}

/// Parses a signed integer in decimal or `0x` hexadecimal.
fn parse_int(name: &'static str, value: Option<&str>) -> Result<i64, SchedError> {
    let s = value.map(str::trim).ok_or(SchedError::InvalidOptionValue(name))?;
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| SchedError::InvalidOptionValue(name))?;
    Ok(if neg { -magnitude } else { magnitude })
}

fn non_negative(name: &'static str, value: Option<&str>) -> Result<u32, SchedError> {
    let v = parse_int(name, value)?;
    u32::try_from(v).map_err(|_| SchedError::InvalidOptionValue(name))
}

impl LwkOptions {
    /// Applies one `name[=value]` option.
    pub fn apply(&mut self, name: &str, value: Option<&str>) -> Result<(), SchedError> {
        match name {
            "lwksched-enable-rr" => {
                const NAME: &str = "lwksched-enable-rr";
                let msecs = non_negative(NAME, value)?;
                self.rr_slice = match msecs {
                    0 => None,
                    m if m < MIN_RR_MSECS => return Err(SchedError::InvalidOptionValue(NAME)),
                    m => Some((m * HZ / 1000).max(1)),
                };
            }
            "lwksched-disable-setaffinity" => {
                let errno = non_negative("lwksched-disable-setaffinity", value)?;
                #[allow(clippy::cast_possible_wrap)]
                let errno = errno as i32;
                self.disable_setaffinity = Some(errno);
            }
            "lwksched-stats" => {
                self.stats_level = non_negative("lwksched-stats", value)?;
            }
            "util-threshold" => {
                const NAME: &str = "util-threshold";
                let (cpus, threads) = value
                    .and_then(|v| v.split_once(':'))
                    .ok_or(SchedError::InvalidOptionValue(NAME))?;
                let cpus = parse_int(NAME, Some(cpus))?;
                let threads = parse_int(NAME, Some(threads))?;
                self.max_cpus_for_util = match cpus {
                    c if c < 0 => None,
                    c => Some(usize::try_from(c).map_err(|_| SchedError::InvalidOptionValue(NAME))?),
                };
                self.max_util_threads_per_cpu = match threads {
                    t if t < 0 => None,
                    t => Some(u32::try_from(t).map_err(|_| SchedError::InvalidOptionValue(NAME))?),
                };
            }
            "overcommit-behavior" => {
                const NAME: &str = "overcommit-behavior";
                self.overcommit = CommitScope::from_raw(parse_int(NAME, value)?)
                    .ok_or(SchedError::InvalidOptionValue(NAME))?;
            }
            "one-cpu-per-util" => self.util_cpus = UtilCpuPolicy::One,
            "move-syscalls-disable" => self.move_syscalls_disable = true,
            "util-threads" => {
                self.util_threads = non_negative("util-threads", value)?;
            }
            _ => return Err(SchedError::UnknownOption),
        }
        Ok(())
    }

    /// Applies a whitespace- or comma-separated list of options.
    pub fn apply_all(&mut self, list: &str) -> Result<(), SchedError> {
        for item in list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            match item.split_once('=') {
                Some((name, value)) => self.apply(name, Some(value))?,
                None => self.apply(item, None)?,
            }
        }
        Ok(())
    }

    /// `true` when threads are time-sliced.
    pub fn round_robin(&self) -> bool {
        self.rr_slice.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = LwkOptions::default();
        assert_eq!(o.max_util_threads_per_cpu, Some(1));
        assert_eq!(o.max_cpus_for_util, None);
        assert_eq!(o.overcommit, CommitScope::UtilityOnly);
        assert_eq!(o.util_cpus, UtilCpuPolicy::Many);
        assert!(!o.round_robin());
    }

    #[test]
    fn enable_rr_converts_to_ticks() {
        let mut o = LwkOptions::default();
        o.apply("lwksched-enable-rr", Some("20")).unwrap();
        assert_eq!(o.rr_slice, Some(20 * HZ / 1000));
        o.apply("lwksched-enable-rr", Some("0")).unwrap();
        assert_eq!(o.rr_slice, None);
        assert!(o.apply("lwksched-enable-rr", Some("-5")).is_err());
        assert!(o.apply("lwksched-enable-rr", None).is_err());
    }

    #[test]
    fn util_threshold_accepts_unlimited() {
        let mut o = LwkOptions::default();
        o.apply("util-threshold", Some("2:-1")).unwrap();
        assert_eq!(o.max_cpus_for_util, Some(2));
        assert_eq!(o.max_util_threads_per_cpu, None);
        assert!(o.apply("util-threshold", Some("2")).is_err());
    }

    #[test]
    fn overcommit_behavior_range() {
        let mut o = LwkOptions::default();
        o.apply("overcommit-behavior", Some("1")).unwrap();
        assert_eq!(o.overcommit, CommitScope::ComputeOnly);
        assert_eq!(
            o.apply("overcommit-behavior", Some("3")),
            Err(SchedError::InvalidOptionValue("overcommit-behavior"))
        );
    }

    #[test]
    fn flags_and_numbers() {
        let mut o = LwkOptions::default();
        o.apply_all("one-cpu-per-util lwksched-stats=0x3,lwksched-disable-setaffinity=1")
            .unwrap();
        assert_eq!(o.util_cpus, UtilCpuPolicy::One);
        assert_eq!(o.stats_level, 3);
        assert_eq!(o.disable_setaffinity, Some(1));
    }

    #[test]
    fn unknown_options_are_reported() {
        let mut o = LwkOptions::default();
        assert_eq!(o.apply("no-such-thing", None), Err(SchedError::UnknownOption));
    }
}

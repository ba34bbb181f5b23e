//! Boot command line configuration for the process and memory core.

use koru_abi::task::{DEFAULT_QUANTUM, DEFAULT_TICKETS, MAX_TICKETS};

use crate::klog::KlogLevel;

const DEFAULT_MAX_PROCESSES: usize = 256;
const MIN_MAX_PROCESSES: usize = 4;
const MAX_MAX_PROCESSES: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SchedPolicyKind {
    #[default]
    Lottery,
    RoundRobin,
}

impl SchedPolicyKind {
    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("lottery") {
            Some(Self::Lottery)
        } else if value.eq_ignore_ascii_case("roundrobin") || value.eq_ignore_ascii_case("rr") {
            Some(Self::RoundRobin)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lottery => "lottery",
            Self::RoundRobin => "roundrobin",
        }
    }
}

impl core::fmt::Display for SchedPolicyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub policy: SchedPolicyKind,
    pub default_quantum: u8,
    pub default_tickets: u64,
    pub max_processes: usize,
    pub ready_queue_capacity: usize,
    /// `None` seeds the lottery from the TSC.
    pub lottery_seed: Option<u64>,
    pub log_level: KlogLevel,
    pub verbose_faults: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            policy: SchedPolicyKind::Lottery,
            default_quantum: DEFAULT_QUANTUM,
            default_tickets: DEFAULT_TICKETS,
            max_processes: DEFAULT_MAX_PROCESSES,
            ready_queue_capacity: DEFAULT_MAX_PROCESSES,
            lottery_seed: None,
            log_level: KlogLevel::Info,
            verbose_faults: false,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse::<u64>().ok(),
    }
}

/// Parse `key=value` tokens. Unknown keys are ignored and malformed values
/// keep their defaults.
pub fn config_from_cmdline(cmdline: Option<&str>) -> KernelConfig {
    let mut cfg = KernelConfig::default();
    let mut ready_queue_set = false;
    if let Some(cmdline) = cmdline {
        for token in cmdline.split_whitespace() {
            if let Some(value) = token.strip_prefix("sched=") {
                if let Some(policy) = SchedPolicyKind::from_str(value) {
                    cfg.policy = policy;
                }
            } else if let Some(value) = token.strip_prefix("quantum=") {
                if let Ok(q) = value.parse::<u8>() {
                    if q > 0 {
                        cfg.default_quantum = q;
                    }
                }
            } else if let Some(value) = token.strip_prefix("tickets=") {
                if let Some(t) = parse_u64(value).filter(|&t| t > 0) {
                    cfg.default_tickets = t.min(MAX_TICKETS);
                }
            } else if let Some(value) = token.strip_prefix("maxprocs=") {
                if let Some(n) = parse_u64(value) {
                    cfg.max_processes = (n as usize).clamp(MIN_MAX_PROCESSES, MAX_MAX_PROCESSES);
                }
            } else if let Some(value) = token.strip_prefix("readyq=") {
                if let Some(n) = parse_u64(value).filter(|&n| n > 0) {
                    cfg.ready_queue_capacity = n as usize;
                    ready_queue_set = true;
                }
            } else if let Some(value) = token.strip_prefix("seed=") {
                if let Some(seed) = parse_u64(value) {
                    cfg.lottery_seed = Some(seed);
                }
            } else if let Some(value) = token.strip_prefix("loglevel=") {
                if let Some(level) = KlogLevel::from_name(value) {
                    cfg.log_level = level;
                }
            } else if let Some(value) = token.strip_prefix("faults.verbose=") {
                if let Some(verbose) = parse_bool(value) {
                    cfg.verbose_faults = verbose;
                }
            }
        }
    }
    if !ready_queue_set {
        cfg.ready_queue_capacity = cfg.max_processes;
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_cmdline() {
        let cfg = config_from_cmdline(None);
        assert_eq!(cfg, KernelConfig::default());
        assert_eq!(cfg.policy, SchedPolicyKind::Lottery);
    }

    #[test]
    fn parses_known_keys() {
        let cfg = config_from_cmdline(Some(
            "console=ttyS0 sched=rr quantum=9 tickets=0x20 maxprocs=64 seed=42 loglevel=debug faults.verbose=on",
        ));
        assert_eq!(cfg.policy, SchedPolicyKind::RoundRobin);
        assert_eq!(cfg.default_quantum, 9);
        assert_eq!(cfg.default_tickets, 0x20);
        assert_eq!(cfg.max_processes, 64);
        assert_eq!(cfg.ready_queue_capacity, 64);
        assert_eq!(cfg.lottery_seed, Some(42));
        assert_eq!(cfg.log_level, KlogLevel::Debug);
        assert!(cfg.verbose_faults);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let cfg = config_from_cmdline(Some("quantum=0 tickets=lots maxprocs=1 readyq=8"));
        assert_eq!(cfg.default_quantum, 5);
        assert_eq!(cfg.default_tickets, 10);
        assert_eq!(cfg.max_processes, MIN_MAX_PROCESSES);
        assert_eq!(cfg.ready_queue_capacity, 8);
    }

    #[test]
    fn ticket_weight_is_capped() {
        let cfg = config_from_cmdline(Some("tickets=18446744073709551615"));
        assert_eq!(cfg.default_tickets, MAX_TICKETS);
    }
}

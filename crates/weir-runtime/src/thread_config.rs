//! Per-thread scheduling configuration: realtime priority, CPU affinity,
//! NUMA memory binding.
//!
//! All failures are non-fatal. Each kind of failure is logged once per
//! process and the pool continues with default settings.

use std::sync::Once;

use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityMode {
    /// Bind worker threads to the listed CPUs.
    Cpu,
    /// Bind worker memory allocations to the listed NUMA nodes.
    Numa,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadConfig {
    /// Fraction of the realtime priority range in `(0, 1]`; values at or
    /// below zero leave the default scheduling policy untouched.
    pub priority: f64,
    pub affinity_mode: Option<AffinityMode>,
    pub affinity: Vec<usize>,
}

/// Apply the configuration to the calling thread.
pub(crate) fn apply_thread_config(config: &ThreadConfig) {
    if let Err(message) = set_priority(config.priority) {
        static PRIORITY_FAILED: Once = Once::new();
        PRIORITY_FAILED.call_once(|| {
            error!(message, "failed to set thread priority");
        });
    }

    match config.affinity_mode {
        Some(AffinityMode::Cpu) => {
            if let Err(message) = set_cpu_affinity(&config.affinity) {
                static CPU_AFFINITY_FAILED: Once = Once::new();
                CPU_AFFINITY_FAILED.call_once(|| {
                    error!(message, "failed to set CPU affinity");
                });
            }
        }
        Some(AffinityMode::Numa) => {
            if let Err(message) = set_numa_affinity(&config.affinity) {
                static NUMA_AFFINITY_FAILED: Once = Once::new();
                NUMA_AFFINITY_FAILED.call_once(|| {
                    error!(message, "failed to set NUMA affinity");
                });
            }
        }
        None => {}
    }
}

#[cfg(target_os = "linux")]
fn errno_string() -> String {
    std::io::Error::last_os_error().to_string()
}

#[cfg(target_os = "linux")]
fn set_priority(priority: f64) -> Result<(), String> {
    if priority <= 0.0 {
        return Ok(());
    }
    let policy = libc::SCHED_RR;
    let max_prio = unsafe { libc::sched_get_priority_max(policy) };
    if max_prio < 0 {
        return Err(errno_string());
    }
    let min_prio = unsafe { libc::sched_get_priority_min(policy) };
    if min_prio < 0 {
        return Err(errno_string());
    }

    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority =
        min_prio + (priority.min(1.0) * f64::from(max_prio - min_prio)) as libc::c_int;
    if unsafe { libc::sched_setscheduler(0, policy, &param) } != 0 {
        return Err(errno_string());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpus: &[usize]) -> Result<(), String> {
    if cpus.is_empty() {
        return Ok(());
    }
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut cpu_set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) != 0 {
            return Err(errno_string());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_numa_affinity(nodes: &[usize]) -> Result<(), String> {
    if nodes.is_empty() {
        return Ok(());
    }
    // Nodemask sized for 1024 nodes, more than any machine in practice.
    let mut mask = [0u64; 16];
    for &node in nodes {
        if node >= mask.len() * 64 {
            return Err(format!("NUMA node {node} out of nodemask range"));
        }
        mask[node / 64] |= 1u64 << (node % 64);
    }
    const MPOL_BIND: libc::c_long = 2;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_BIND,
            mask.as_ptr(),
            (mask.len() * 64) as libc::c_ulong,
        )
    };
    if rc != 0 {
        return Err(errno_string());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_priority(priority: f64) -> Result<(), String> {
    if priority <= 0.0 {
        return Ok(());
    }
    Err("thread priority is not supported on this platform".to_string())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(cpus: &[usize]) -> Result<(), String> {
    if cpus.is_empty() {
        return Ok(());
    }
    Err("CPU affinity is not supported on this platform".to_string())
}

#[cfg(not(target_os = "linux"))]
fn set_numa_affinity(nodes: &[usize]) -> Result<(), String> {
    if nodes.is_empty() {
        return Ok(());
    }
    Err("NUMA affinity is not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::{apply_thread_config, ThreadConfig};

    #[test]
    fn default_config_is_a_no_op() {
        // Nothing requested, nothing applied, nothing logged.
        apply_thread_config(&ThreadConfig::default());
    }

    #[test]
    fn failures_do_not_propagate() {
        // Requesting realtime priority usually fails without privileges;
        // the call must still return normally.
        apply_thread_config(&ThreadConfig {
            priority: 0.5,
            affinity_mode: None,
            affinity: Vec::new(),
        });
    }
}

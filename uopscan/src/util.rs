
pub mod msr;

use std::io::Read;

use crate::error::{ HarnessError, Result };

/// Utilities for inspecting and controlling the state of the current process
/// and the host it's running on.
pub struct HostEnv;
impl HostEnv {
    const BOOST_PATH: &'static str =
        "/sys/devices/system/cpu/cpufreq/boost";
    const ISOLATED_PATH: &'static str =
        "/sys/devices/system/cpu/isolated";
    const NOHZ_PATH: &'static str =
        "/sys/devices/system/cpu/nohz_full";
    const RDPMC_PATH: &'static str =
        "/sys/bus/event_source/devices/cpu/rdpmc";
    const SMT_PATH: &'static str =
        "/sys/devices/system/cpu/smt/control";
    const MMAP_MIN_PATH: &'static str =
        "/proc/sys/vm/mmap_min_addr";

    fn read_trimmed(path: &str) -> std::io::Result<String> {
        let mut f = std::fs::File::open(path)?;
        let mut res = String::new();
        f.read_to_string(&mut res)?;
        Ok(res.trim().to_string())
    }

    fn unexpected(path: &str, val: &str) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData,
            format!("unexpected value {:?} in {}", val, path)
        )
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> std::io::Result<String> {
        let res = Self::read_trimmed(Self::ISOLATED_PATH)?;
        Ok(if res.is_empty() { "disabled".to_string() } else { res })
    }

    /// Return a string describing the set of 'nohz_full' cores.
    pub fn sysfs_nohz() -> std::io::Result<String> {
        let res = Self::read_trimmed(Self::NOHZ_PATH)?;
        Ok(if res.is_empty() { "disabled".to_string() } else { res })
    }

    /// Returns true if cpufreq boost is enabled.
    pub fn sysfs_cpufreq_boost_enabled() -> std::io::Result<bool> {
        match Self::read_trimmed(Self::BOOST_PATH)?.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            x => Err(Self::unexpected(Self::BOOST_PATH, x)),
        }
    }

    /// Return the cpufreq scaling governor for a particular core.
    pub fn sysfs_cpufreq_governor(n: usize) -> std::io::Result<String> {
        Self::read_trimmed(&format!(
            "/sys/devices/system/cpu/cpufreq/policy{}/scaling_governor", n
        ))
    }

    /// Return the minimum supported `mmap()` address.
    pub fn procfs_mmap_min_addr() -> std::io::Result<usize> {
        let res = Self::read_trimmed(Self::MMAP_MIN_PATH)?;
        res.parse().map_err(|_| Self::unexpected(Self::MMAP_MIN_PATH, &res))
    }

    /// Returns true if userspace RDPMC is allowed for all processes.
    ///
    /// A value of '1' only allows RDPMC while a perf event is mapped, which
    /// the 'perf-event' crate doesn't do for us.
    pub fn sysfs_rdpmc_enabled() -> std::io::Result<bool> {
        match Self::read_trimmed(Self::RDPMC_PATH)?.as_str() {
            "0" | "1" => Ok(false),
            "2" => Ok(true),
            x => Err(Self::unexpected(Self::RDPMC_PATH, x)),
        }
    }

    /// Returns true if SMT is enabled.
    pub fn sysfs_smt_enabled() -> std::io::Result<bool> {
        match Self::read_trimmed(Self::SMT_PATH)?.as_str() {
            "off" | "forceoff" | "notsupported" | "notimplemented" => Ok(false),
            "on" => Ok(true),
            x => Err(Self::unexpected(Self::SMT_PATH, x)),
        }
    }

    /// Return the number of online cores.
    pub fn online_cores() -> Option<usize> {
        nix::unistd::sysconf(nix::unistd::SysconfVar::_NPROCESSORS_ONLN)
            .ok()
            .flatten()
            .map(|n| n as usize)
    }
}

impl HostEnv {
    /// Pin the current thread to a particular core.
    pub fn pin_to_core(core: usize) -> Result<()> {
        let this_pid = nix::unistd::Pid::from_raw(0);
        let mut cpuset = nix::sched::CpuSet::new();
        cpuset.set(core).map_err(|errno| HarnessError::Pin { core, errno })?;
        nix::sched::sched_setaffinity(this_pid, &cpuset)
            .map_err(|errno| HarnessError::Pin { core, errno })?;
        tracing::debug!("pinned to core {}", core);
        Ok(())
    }

    /// Return the processor brand string (CPUID leaves 0x8000_0002..=4).
    #[cfg(target_arch = "x86_64")]
    pub fn cpu_brand() -> String {
        use std::arch::x86_64::__cpuid;
        let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_ext < 0x8000_0004 {
            return "unknown".to_string();
        }
        let mut bytes = Vec::with_capacity(48);
        for leaf in 0x8000_0002..=0x8000_0004u32 {
            let r = unsafe { __cpuid(leaf) };
            for reg in [r.eax, r.ebx, r.ecx, r.edx] {
                bytes.extend_from_slice(&reg.to_le_bytes());
            }
        }
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).trim().to_string()
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn cpu_brand() -> String { "unknown".to_string() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn brand_is_printable() {
        let brand = HostEnv::cpu_brand();
        assert!(!brand.is_empty());
        assert!(brand.chars().all(|c| !c.is_control()));
    }
}


use uopscan::HostEnv;
use uopscan::util::msr::{ Msr, MSR_SMI_COUNT };

fn describe<T: std::fmt::Display>(res: std::io::Result<T>) -> String {
    match res {
        Ok(x) => x.to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            "<read error; are you root?>".to_string()
        },
        Err(e) => format!("<{}>", e),
    }
}

fn flag(res: std::io::Result<bool>, bad_when: bool) -> String {
    match res {
        Ok(x) if x == bad_when => format!("{} [!!]", if x { "enabled" } else { "disabled" }),
        Ok(x) => (if x { "enabled" } else { "disabled" }).to_string(),
        Err(e) => describe::<bool>(Err(e)),
    }
}

fn main() {
    let core = std::env::args().nth(1)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(3);

    let num_cores = HostEnv::online_cores()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let smi = match Msr::rdmsr(MSR_SMI_COUNT, core) {
        Ok(n) => n.to_string(),
        Err(e) => format!("<{}>", e),
    };
    let gov = describe(HostEnv::sysfs_cpufreq_governor(core));

    println!("[*] 'uopscan' environment summary:");
    println!("  {:<40}: {}", "cpu", HostEnv::cpu_brand());
    println!("  {:<40}: {}", "online cores", num_cores);
    println!("  {:<40}: {}", "isolated cores", describe(HostEnv::sysfs_isolated()));
    println!("  {:<40}: {}", "nohz_full cores", describe(HostEnv::sysfs_nohz()));
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)",
        flag(HostEnv::sysfs_smt_enabled(), true));
    println!("  {:<40}: {}", "cpufreq boost",
        flag(HostEnv::sysfs_cpufreq_boost_enabled(), true));
    println!("  {:<40}: {}", format!("cpufreq scaling (core {})", core), gov);
    println!("  {:<40}: {}", "userspace rdpmc",
        flag(HostEnv::sysfs_rdpmc_enabled(), false));
    println!("  {:<40}: {}", "vm.mmap_min_addr", describe(HostEnv::procfs_mmap_min_addr()));
    println!("  {:<40}: {}", format!("SMI count (core {})", core), smi);
}

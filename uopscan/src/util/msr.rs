//! Module for interacting with `/dev/cpu/N/msr`.

use std::os::fd::RawFd;

use crate::error::{ HarnessError, Result };

/// `MSR_SMI_COUNT`: number of SMIs taken since reset.
pub const MSR_SMI_COUNT: u32 = 0x34;

/// An open handle to `/dev/cpu/N/msr`.
///
/// We read the SMI counter twice per sample, so the file stays open for
/// as long as the handle lives.
pub struct Msr {
    fd: RawFd,
    cpu: usize,
}
impl Msr {
    pub fn open(cpu: usize) -> Result<Self> {
        let filename = format!("/dev/cpu/{}/msr", cpu);
        let fd = nix::fcntl::open(filename.as_str(),
            nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::S_IRUSR
        ).map_err(|errno| HarnessError::Msr { msr: 0, cpu, errno })?;
        Ok(Self { fd, cpu })
    }

    pub fn cpu(&self) -> usize { self.cpu }

    /// Read an MSR.
    pub fn read(&self, msr: u32) -> Result<u64> {
        let mut buf = [0u8; 8];
        nix::sys::uio::pread(self.fd, &mut buf, msr as i64)
            .map_err(|errno| HarnessError::Msr { msr, cpu: self.cpu, errno })?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read an MSR once on the given CPU.
    pub fn rdmsr(msr: u32, cpu: usize) -> Result<u64> {
        Self::open(cpu)?.read(msr)
    }
}
impl Drop for Msr {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

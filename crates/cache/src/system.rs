//! Process and system memory probes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of process and machine memory figures
pub trait SystemMemoryProbe: Send + Sync {
    /// Resident set size of this process in bytes
    fn process_usage(&self) -> Option<u64>;

    /// Physical memory installed in bytes
    fn total_memory(&self) -> Option<u64>;

    /// `process_usage / total_memory`, 0.0 when either is unknown
    fn pressure(&self) -> f64 {
        match (self.process_usage(), self.total_memory()) {
            (Some(usage), Some(total)) if usage > 0 && total > 0 => usage as f64 / total as f64,
            _ => 0.0,
        }
    }
}

/// Probe backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMemoryProbe;

impl SystemMemoryProbe for OsMemoryProbe {
    fn process_usage(&self) -> Option<u64> {
        current_rss_bytes()
    }

    fn total_memory(&self) -> Option<u64> {
        physical_ram_bytes()
    }
}

/// Probe returning figures set by the caller
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    usage: AtomicU64,
    total: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(usage: u64, total: u64) -> Self {
        Self {
            usage: AtomicU64::new(usage),
            total: AtomicU64::new(total),
        }
    }

    pub fn set_usage(&self, usage: u64) {
        self.usage.store(usage, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }
}

impl SystemMemoryProbe for FixedMemoryProbe {
    fn process_usage(&self) -> Option<u64> {
        Some(self.usage.load(Ordering::Relaxed)).filter(|&v| v > 0)
    }

    fn total_memory(&self) -> Option<u64> {
        Some(self.total.load(Ordering::Relaxed)).filter(|&v| v > 0)
    }
}

#[cfg(target_os = "macos")]
pub fn physical_ram_bytes() -> Option<u64> {
    use std::ffi::CString;
    use std::mem::size_of;
    use std::ptr;

    let key = CString::new("hw.memsize").ok()?;
    let mut value: u64 = 0;
    let mut len = size_of::<u64>();
    let rc = unsafe {
        libc::sysctlbyname(
            key.as_ptr(),
            &mut value as *mut u64 as *mut libc::c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rc == 0 && len == size_of::<u64>() {
        Some(value)
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
pub fn physical_ram_bytes() -> Option<u64> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    Some((info.totalram as u64).saturating_mul(info.mem_unit as u64))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn physical_ram_bytes() -> Option<u64> {
    None
}

#[cfg(target_os = "macos")]
pub fn current_rss_bytes() -> Option<u64> {
    let mut info = libc::mach_task_basic_info {
        virtual_size: 0,
        resident_size: 0,
        resident_size_max: 0,
        user_time: libc::time_value_t { seconds: 0, microseconds: 0 },
        system_time: libc::time_value_t { seconds: 0, microseconds: 0 },
        policy: 0,
        suspend_count: 0,
    };

    let mut count = libc::MACH_TASK_BASIC_INFO_COUNT;
    #[allow(deprecated)]
    let kr = unsafe {
        libc::task_info(
            libc::mach_task_self(),
            libc::MACH_TASK_BASIC_INFO,
            (&mut info as *mut libc::mach_task_basic_info).cast(),
            &mut count,
        )
    };
    if kr == libc::KERN_SUCCESS {
        Some(info.resident_size as u64)
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
pub fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages = statm.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(rss_pages.saturating_mul(page_size as u64))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn current_rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe_pressure() {
        let probe = FixedMemoryProbe::new(900, 1000);
        assert!((probe.pressure() - 0.9).abs() < 1e-9);

        probe.set_usage(0);
        assert_eq!(probe.pressure(), 0.0);

        probe.set_usage(100);
        probe.set_total(0);
        assert_eq!(probe.pressure(), 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_os_probe_reports_values() {
        let probe = OsMemoryProbe;
        let total = probe.total_memory().unwrap();
        let rss = probe.process_usage().unwrap();
        assert!(total > 0);
        assert!(rss > 0 && rss < total);
        assert!(probe.pressure() > 0.0 && probe.pressure() < 1.0);
    }
}

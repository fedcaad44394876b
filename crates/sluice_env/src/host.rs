// host.rs
//! Cross-platform helpers to query the logical processor count and total system RAM.
//! Falls back to conservative defaults when unavailable.

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub logical_processors: usize,
    pub total_ram: u64, // bytes
}

impl Host {
    /// Probe once per process; later calls return the cached result.
    pub fn detect() -> Self {
        static INSTANCE: OnceLock<Host> = OnceLock::new();
        *INSTANCE.get_or_init(Self::detect_impl)
    }

    fn detect_impl() -> Self {
        Self {
            logical_processors: logical_processors().unwrap_or(1),
            total_ram: total_ram_bytes().unwrap_or(1024 * 1024 * 1024),
        }
    }
}

fn logical_processors() -> Option<usize> {
    std::thread::available_parallelism().ok().map(|n| n.get())
}

/* -------------------------- Windows -------------------------- */

#[cfg(target_os = "windows")]
fn total_ram_bytes() -> Option<u64> {
    use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};
    unsafe {
        let mut st = MEMORYSTATUSEX {
            dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
            ..std::mem::zeroed()
        };
        if GlobalMemoryStatusEx(&mut st) != 0 {
            Some(st.ullTotalPhys)
        } else {
            None
        }
    }
}

/* --------------------- macOS / iOS (Darwin) --------------------- */

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn total_ram_bytes() -> Option<u64> {
    use libc::{c_void, size_t, sysctlbyname};
    let cname = std::ffi::CString::new("hw.memsize").ok()?;
    let mut val: u64 = 0;
    let mut len: size_t = std::mem::size_of::<u64>() as _;
    let rc = unsafe {
        sysctlbyname(
            cname.as_ptr(),
            &mut val as *mut _ as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == 0 && val != 0 {
        Some(val)
    } else {
        None
    }
}

/* --------------------- Linux / Android --------------------- */

#[cfg(any(target_os = "linux", target_os = "android"))]
fn total_ram_bytes() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&text)
}

/// Parses the `MemTotal:  16367168 kB` line of `/proc/meminfo`.
#[cfg(any(target_os = "linux", target_os = "android", test))]
fn parse_meminfo_total(text: &str) -> Option<u64> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/* --------------------- Other / WASM / Fallbacks --------------------- */

#[cfg(not(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "ios",
    target_os = "linux",
    target_os = "android"
)))]
fn total_ram_bytes() -> Option<u64> {
    None
}

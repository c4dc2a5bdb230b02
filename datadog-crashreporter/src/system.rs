// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process and OS facts captured once at install time.
//!
//! Everything here is gathered while allocation is still legal and held as
//! plain owned data; at fault time the writer only formats it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Read;

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub process_name: String,
    pub process_id: u32,
    pub parent_process_id: u32,
    pub cpu_arch: &'static str,
    pub machine: String,
    pub kernel_version: String,
    pub os_type: String,
    pub os_version: String,
    pub memory_size: u64,
    pub usable_memory: u64,
    pub free_memory: u64,
    pub page_size: u64,
    /// ISO-8601 UTC, None when the kernel does not expose boot time.
    pub boot_time: Option<String>,
    pub app_start_time: String,
    pub build_type: &'static str,
    pub executable_path: String,
}

pub fn collect(app_name: &str) -> SystemInfo {
    let info = os_info::get();
    let (machine, kernel_version) = uname_facts();
    let page = page_size::get() as u64;

    SystemInfo {
        process_name: app_name.to_string(),
        process_id: std::process::id(),
        // SAFETY: getppid always succeeds.
        parent_process_id: unsafe { libc::getppid() } as u32,
        cpu_arch: std::env::consts::ARCH,
        machine,
        kernel_version,
        os_type: info.os_type().to_string(),
        os_version: info.version().to_string(),
        memory_size: sysconf_pages(libc::_SC_PHYS_PAGES) * page,
        usable_memory: meminfo_kib("MemAvailable:")
            .map(|k| k * 1024)
            .unwrap_or_else(|| sysconf_pages(libc::_SC_AVPHYS_PAGES) * page),
        free_memory: meminfo_kib("MemFree:")
            .map(|k| k * 1024)
            .unwrap_or_else(|| sysconf_pages(libc::_SC_AVPHYS_PAGES) * page),
        page_size: page,
        boot_time: read_boot_time(),
        app_start_time: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        build_type: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        executable_path: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    }
}

fn sysconf_pages(name: libc::c_int) -> u64 {
    // SAFETY: sysconf has no memory preconditions.
    let value = unsafe { libc::sysconf(name) };
    if value < 0 {
        0
    } else {
        value as u64
    }
}

fn uname_facts() -> (String, String) {
    // SAFETY: uname fills the struct or fails.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return (String::new(), String::new());
    }
    (cstr_field(&uts.machine), cstr_field(&uts.release))
}

fn cstr_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(target_os = "linux")]
fn meminfo_kib(key: &str) -> Option<u64> {
    let mut contents = String::new();
    std::fs::File::open("/proc/meminfo")
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    let line = contents.lines().find(|l| l.starts_with(key))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn meminfo_kib(_key: &str) -> Option<u64> {
    None
}

/// Boot time from the `btime` line of `/proc/stat`, as ISO-8601 UTC.
#[cfg(target_os = "linux")]
fn read_boot_time() -> Option<String> {
    let mut contents = String::new();
    std::fs::File::open("/proc/stat")
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    let line = contents.lines().find(|l| l.starts_with("btime "))?;
    let seconds: i64 = line.split_whitespace().nth(1)?.parse().ok()?;
    let when: DateTime<Utc> = DateTime::from_timestamp(seconds, 0)?;
    Some(when.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

#[cfg(not(target_os = "linux"))]
fn read_boot_time() -> Option<String> {
    None
}

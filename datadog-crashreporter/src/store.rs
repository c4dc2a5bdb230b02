// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk report rotation.
//!
//! Reports live at `<dir>/<app_name>-report-<016x>.json`. Ids are
//! monotonically increasing, seeded from the wall clock in microseconds
//! when the store opens, so the id embedded in a file name is also its age
//! and "delete the oldest" is a numeric sort. The store never allocates on
//! the fault path: the installer pre-renders the next report path into a
//! fixed buffer (see [`ReportStore::render_next_path`]) and pruning always
//! happens off-path.

use crate::shared::constants::MAX_REPORT_PATH;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct ReportStore {
    directory: PathBuf,
    app_name: String,
    max_report_count: usize,
    next_id: AtomicU64,
}

impl ReportStore {
    /// Opens (creating if needed) the store at `directory`.
    pub fn new(
        directory: PathBuf,
        app_name: String,
        max_report_count: usize,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;
        // A clock stuck before the epoch still needs unique-ish ids.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_else(|_| rand::random::<u64>() >> 16);
        let store = Self {
            directory,
            app_name,
            max_report_count,
            next_id: AtomicU64::new(seed),
        };
        // Clocks move backwards; never reissue an id that is already on disk.
        if let Some(max_existing) = store.report_ids().last() {
            let floor = max_existing + 1;
            store.next_id.fetch_max(floor, SeqCst);
        }
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Claims the next report id.
    pub fn next_report_id(&self) -> u64 {
        self.next_id.fetch_add(1, SeqCst)
    }

    pub fn path_for_id(&self, id: u64) -> PathBuf {
        self.directory
            .join(format!("{}-report-{:016x}.json", self.app_name, id))
    }

    /// Renders the path for `id` into `buf` as a NUL-terminated byte
    /// string for use by the fault path. Returns the length excluding the
    /// terminator, or None when it does not fit.
    pub fn render_next_path(&self, id: u64, buf: &mut [u8; MAX_REPORT_PATH]) -> Option<usize> {
        let rendered = self.path_for_id(id);
        let bytes = rendered.as_os_str().as_encoded_bytes();
        if bytes.len() + 1 > buf.len() {
            return None;
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[bytes.len()] = 0;
        Some(bytes.len())
    }

    /// Ids of all reports on disk, oldest first.
    pub fn report_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("failed to list report directory: {e}");
                return ids;
            }
        };
        let prefix = format!("{}-report-", self.app_name);
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(hex) = rest.strip_suffix(".json") else {
                continue;
            };
            if let Ok(id) = u64::from_str_radix(hex, 16) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids
    }

    pub fn report_count(&self) -> usize {
        self.report_ids().len()
    }

    pub fn read_report(&self, id: u64) -> anyhow::Result<String> {
        let path = self.path_for_id(id);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read report {}", path.display()))
    }

    /// Stores host-supplied report contents under a fresh id, pruning as
    /// for any other report. Returns the new id.
    pub fn add_user_report(&self, contents: &str) -> anyhow::Result<u64> {
        let id = self.next_report_id();
        let path = self.path_for_id(id);
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        self.prune_old_reports();
        Ok(id)
    }

    pub fn delete_report(&self, id: u64) -> anyhow::Result<()> {
        let path = self.path_for_id(id);
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to delete report {}", path.display()))
    }

    pub fn delete_all_reports(&self) {
        for id in self.report_ids() {
            if let Err(e) = self.delete_report(id) {
                log::warn!("{e:#}");
            }
        }
    }

    /// Deletes the oldest reports until at most `max_report_count` remain.
    pub fn prune_old_reports(&self) {
        let ids = self.report_ids();
        if ids.len() <= self.max_report_count {
            return;
        }
        let excess = ids.len() - self.max_report_count;
        for id in &ids[..excess] {
            if let Err(e) = self.delete_report(*id) {
                log::warn!("pruning: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, max: usize) -> ReportStore {
        ReportStore::new(dir.path().to_path_buf(), "testapp".to_string(), max).unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        let a = store.next_report_id();
        let b = store.next_report_id();
        assert!(b > a);
    }

    #[test]
    fn test_path_shape() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        let path = store.path_for_id(0xAB);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "testapp-report-00000000000000ab.json");
    }

    #[test]
    fn test_rendered_path_is_nul_terminated() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        let mut buf = [0u8; MAX_REPORT_PATH];
        let len = store.render_next_path(7, &mut buf).unwrap();
        assert_eq!(buf[len], 0);
        let s = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(s.ends_with("testapp-report-0000000000000007.json"));
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.add_user_report(&format!("{{\"n\":{i}}}")).unwrap());
        }
        assert_eq!(store.report_count(), 3);
        let surviving = store.report_ids();
        assert_eq!(surviving, ids[2..].to_vec(), "two lowest ids must be gone");
    }

    #[test]
    fn test_read_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        let id = store.add_user_report("{\"k\":1}").unwrap();
        assert_eq!(store.read_report(id).unwrap(), "{\"k\":1}");
        store.delete_report(id).unwrap();
        assert!(store.read_report(id).is_err());
        assert_eq!(store.report_count(), 0);
    }

    #[test]
    fn test_delete_all() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        for _ in 0..4 {
            store.add_user_report("{}").unwrap();
        }
        store.delete_all_reports();
        assert_eq!(store.report_count(), 0);
    }

    #[test]
    fn test_reopen_respects_existing_ids() {
        let dir = TempDir::new().unwrap();
        let first = store(&dir, 5);
        let existing = first.add_user_report("{}").unwrap();
        drop(first);
        let second = store(&dir, 5);
        let fresh = second.next_report_id();
        assert!(fresh > existing);
    }

    #[test]
    fn test_foreign_files_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 5);
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("otherapp-report-0000000000000001.json"), "{}").unwrap();
        assert_eq!(store.report_count(), 0);
    }
}

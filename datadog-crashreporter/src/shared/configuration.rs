// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::monitors::MonitorType;
use crate::report::writer::UserSectionWriter;
use crate::shared::constants::DEFAULT_MAX_REPORT_COUNT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("max_report_count must be at least 1")]
    ZeroReportCount,
    #[error("install_dir must not be empty")]
    EmptyInstallDir,
    #[error("app_name must not be empty")]
    EmptyAppName,
    #[error("user_info_json is not a JSON object: {0}")]
    InvalidUserInfo(#[from] serde_json::Error),
}

/// Host callback invoked synchronously while the writer has the report's
/// `user` object open. Runs on the faulting thread; implementations must
/// not allocate when the capture required async safety.
pub type UserSectionCallback = Arc<dyn Fn(&mut UserSectionWriter<'_, '_>) + Send + Sync>;

/// Installer configuration.
///
/// Built once by the host and handed to [`crate::install`]. Everything the
/// capture path needs is copied out of here at install time so the fault
/// path never touches host-owned memory.
#[derive(Clone, Serialize, Deserialize)]
pub struct CrashReporterConfiguration {
    /// Which fault sources to arm. Filtered against debugger- and
    /// async-safety masks at install time.
    pub monitor_mask: MonitorType,
    /// Root directory for reports, state, and the console log.
    pub install_dir: PathBuf,
    /// Used in report file names and the `process_name` field.
    pub app_name: String,
    /// Rotation cap; the store deletes the oldest report beyond this.
    pub max_report_count: usize,
    /// Main-thread watchdog interval. Zero disables the deadlock monitor.
    pub deadlock_watchdog_interval: Duration,
    /// Enables the notable-address sweep and object field enumeration.
    pub introspect_memory: bool,
    /// Classes recorded by name only, never dereferenced.
    pub do_not_introspect_classes: Vec<String>,
    /// Inline the captured console log under `debug.console_log`.
    pub add_console_log_to_report: bool,
    /// Echo the previous session's console log to stdout at install.
    pub print_previous_log: bool,
    /// Opaque JSON object appended under the report's `user` object.
    pub user_info_json: Option<String>,
    /// Host hook for emitting extra fields into the `user` object.
    #[serde(skip)]
    pub user_section_write_callback: Option<UserSectionCallback>,
}

impl std::fmt::Debug for CrashReporterConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashReporterConfiguration")
            .field("monitor_mask", &self.monitor_mask)
            .field("install_dir", &self.install_dir)
            .field("app_name", &self.app_name)
            .field("max_report_count", &self.max_report_count)
            .field(
                "deadlock_watchdog_interval",
                &self.deadlock_watchdog_interval,
            )
            .field("introspect_memory", &self.introspect_memory)
            .field(
                "do_not_introspect_classes",
                &self.do_not_introspect_classes,
            )
            .field("add_console_log_to_report", &self.add_console_log_to_report)
            .field("print_previous_log", &self.print_previous_log)
            .field("user_info_json", &self.user_info_json)
            .field(
                "user_section_write_callback",
                &self.user_section_write_callback.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl CrashReporterConfiguration {
    /// Validating constructor. The remaining fields start from
    /// [`Default`] and can be adjusted before install.
    pub fn new(
        install_dir: PathBuf,
        app_name: String,
        monitor_mask: MonitorType,
    ) -> Result<Self, ConfigurationError> {
        if install_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::EmptyInstallDir);
        }
        if app_name.is_empty() {
            return Err(ConfigurationError::EmptyAppName);
        }
        Ok(Self {
            monitor_mask,
            install_dir,
            app_name,
            ..Default::default()
        })
    }

    /// Checks invariants that `new` cannot see because the host mutated
    /// public fields afterwards. Called by the installer.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_report_count == 0 {
            return Err(ConfigurationError::ZeroReportCount);
        }
        if self.install_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::EmptyInstallDir);
        }
        if self.app_name.is_empty() {
            return Err(ConfigurationError::EmptyAppName);
        }
        if let Some(json) = &self.user_info_json {
            let value: serde_json::Value = serde_json::from_str(json)?;
            if !value.is_object() {
                return Err(ConfigurationError::InvalidUserInfo(
                    serde::de::Error::custom("expected a JSON object"),
                ));
            }
        }
        Ok(())
    }
}

impl Default for CrashReporterConfiguration {
    fn default() -> Self {
        Self {
            monitor_mask: MonitorType::PRODUCTION_SAFE_MINIMAL,
            install_dir: PathBuf::new(),
            app_name: String::new(),
            max_report_count: DEFAULT_MAX_REPORT_COUNT,
            deadlock_watchdog_interval: Duration::ZERO,
            introspect_memory: true,
            do_not_introspect_classes: Vec::new(),
            add_console_log_to_report: false,
            print_previous_log: false,
            user_info_json: None,
            user_section_write_callback: None,
        }
    }
}

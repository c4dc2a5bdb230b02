// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-launch application state: "how many launches since the last
//! crash", active/background time accounting, and the crashed-last-launch
//! determination the host reads at startup.
//!
//! The state is serialized as JSON with a version integer on every
//! foreground-to-background transition, on terminate, and on crash. An
//! unknown version on load is treated as no prior state.
//!
//! The crash-time save must not allocate, so every off-path save also
//! re-renders a "this run crashed" variant of the file into a fixed buffer
//! that the fault path can flush with raw write(2).

use crate::shared::constants::APP_STATE_VERSION;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u32),
}

/// The subset persisted to disk between launches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PersistedState {
    version: u32,
    #[serde(rename = "crashedLastLaunch")]
    crashed_last_launch: bool,
    #[serde(rename = "activeDurationSinceLastCrash")]
    active_duration_since_last_crash: f64,
    #[serde(rename = "backgroundDurationSinceLastCrash")]
    background_duration_since_last_crash: f64,
    #[serde(rename = "launchesSinceLastCrash")]
    launches_since_last_crash: u32,
    #[serde(rename = "sessionsSinceLastCrash")]
    sessions_since_last_crash: u32,
}

/// Full in-memory state; the non-persisted fields reset every launch.
#[derive(Debug, Clone)]
struct AppState {
    active_duration_since_launch: f64,
    background_duration_since_launch: f64,
    active_duration_since_last_crash: f64,
    background_duration_since_last_crash: f64,
    launches_since_last_crash: u32,
    sessions_since_last_crash: u32,
    sessions_since_launch: u32,
    crashed_this_launch: bool,
    crashed_last_launch: bool,
    application_is_active: bool,
    application_is_in_foreground: bool,
    transition_time: Instant,
}

/// Copy of the counters embedded into a `FaultContext` by the
/// application-state monitor's enrichment pass.
#[derive(Debug, Clone, Copy)]
pub struct AppStateSnapshot {
    pub active_duration_since_launch: f64,
    pub background_duration_since_launch: f64,
    pub active_duration_since_last_crash: f64,
    pub background_duration_since_last_crash: f64,
    pub launches_since_last_crash: u32,
    pub sessions_since_last_crash: u32,
    pub sessions_since_launch: u32,
    pub application_is_active: bool,
    pub application_is_in_foreground: bool,
}

const CRASH_IMAGE_SIZE: usize = 512;

pub struct CrashStateTracker {
    path: PathBuf,
    state: Mutex<AppState>,
    /// Pre-rendered `crashed=true` JSON plus the NUL-terminated file path,
    /// consumed by [`notify_app_crash`](Self::notify_app_crash) with raw
    /// syscalls only.
    crash_image: Mutex<([u8; CRASH_IMAGE_SIZE], usize)>,
    path_bytes: Vec<u8>,
}

impl CrashStateTracker {
    /// Loads prior state from `path` (or starts fresh) and folds in this
    /// launch: the previous run's crash flag becomes `crashed_last_launch`,
    /// and a crashed previous run zeroes the since-crash counters before
    /// this launch is counted.
    pub fn new(path: PathBuf) -> Result<Self, StateError> {
        let previous = match Self::load(&path) {
            Ok(state) => Some(state),
            Err(StateError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("discarding unreadable app state: {e}");
                None
            }
        };

        let mut state = AppState {
            active_duration_since_launch: 0.0,
            background_duration_since_launch: 0.0,
            active_duration_since_last_crash: 0.0,
            background_duration_since_last_crash: 0.0,
            launches_since_last_crash: 0,
            sessions_since_last_crash: 0,
            sessions_since_launch: 0,
            crashed_this_launch: false,
            crashed_last_launch: false,
            application_is_active: false,
            application_is_in_foreground: false,
            transition_time: Instant::now(),
        };
        if let Some(previous) = previous {
            state.crashed_last_launch = previous.crashed_last_launch;
            if previous.crashed_last_launch {
                // Counters restart at zero; this launch is counted below.
                state.active_duration_since_last_crash = 0.0;
                state.background_duration_since_last_crash = 0.0;
                state.launches_since_last_crash = 0;
                state.sessions_since_last_crash = 0;
            } else {
                state.active_duration_since_last_crash =
                    previous.active_duration_since_last_crash;
                state.background_duration_since_last_crash =
                    previous.background_duration_since_last_crash;
                state.launches_since_last_crash = previous.launches_since_last_crash;
                state.sessions_since_last_crash = previous.sessions_since_last_crash;
            }
        }
        state.launches_since_last_crash += 1;

        let mut path_bytes = path.as_os_str().as_encoded_bytes().to_vec();
        path_bytes.push(0);

        let tracker = Self {
            path,
            state: Mutex::new(state),
            crash_image: Mutex::new(([0; CRASH_IMAGE_SIZE], 0)),
            path_bytes,
        };
        tracker.render_crash_image();
        Ok(tracker)
    }

    fn load(path: &Path) -> Result<PersistedState, StateError> {
        let contents = std::fs::read_to_string(path)?;
        let state: PersistedState = serde_json::from_str(&contents)?;
        if state.version != APP_STATE_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }

    /// Marks the application active or inactive, folding the elapsed span
    /// into the appropriate duration counters.
    pub fn notify_app_active(&self, active: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.application_is_active == active {
                return;
            }
            let elapsed = state.transition_time.elapsed().as_secs_f64();
            if state.application_is_active {
                state.active_duration_since_launch += elapsed;
                state.active_duration_since_last_crash += elapsed;
            }
            state.application_is_active = active;
            state.transition_time = Instant::now();
        }
        self.render_crash_image();
    }

    /// Foreground/background transition. Entering the foreground counts a
    /// session; leaving it persists the state.
    pub fn notify_app_in_foreground(&self, in_foreground: bool) {
        let persist = {
            let mut state = self.state.lock().unwrap();
            if state.application_is_in_foreground == in_foreground {
                false
            } else {
                let elapsed = state.transition_time.elapsed().as_secs_f64();
                state.application_is_in_foreground = in_foreground;
                state.transition_time = Instant::now();
                if in_foreground {
                    state.sessions_since_launch += 1;
                    state.sessions_since_last_crash += 1;
                    false
                } else {
                    state.background_duration_since_launch += elapsed;
                    state.background_duration_since_last_crash += elapsed;
                    true
                }
            }
        };
        if persist {
            if let Err(e) = self.save(false) {
                log::warn!("failed to persist app state on backgrounding: {e}");
            }
        }
        self.render_crash_image();
    }

    /// Normal termination: close out the durations and persist.
    pub fn notify_app_terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let elapsed = state.transition_time.elapsed().as_secs_f64();
            if state.application_is_active {
                state.active_duration_since_launch += elapsed;
                state.active_duration_since_last_crash += elapsed;
            }
        }
        if let Err(e) = self.save(false) {
            log::warn!("failed to persist app state on terminate: {e}");
        }
    }

    /// Crash notification, callable from a signal handler: flushes the
    /// pre-rendered crashed-state image with open/write/close only.
    pub fn notify_app_crash(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.crashed_this_launch = true;
        }
        let image = match self.crash_image.try_lock() {
            Ok(image) => image,
            // A transition callback is mid-render; the image it just wrote
            // is still current enough.
            Err(_) => return self.write_crash_image_fallback(),
        };
        let (buf, len) = &*image;
        // SAFETY: path_bytes is NUL-terminated; buf[..len] is rendered JSON.
        unsafe {
            let fd = libc::open(
                self.path_bytes.as_ptr() as *const libc::c_char,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                0o644,
            );
            if fd < 0 {
                return;
            }
            let mut at = 0usize;
            while at < *len {
                let n = libc::write(
                    fd,
                    buf.as_ptr().add(at) as *const libc::c_void,
                    len - at,
                );
                if n <= 0 {
                    break;
                }
                at += n as usize;
            }
            libc::close(fd);
        }
    }

    fn write_crash_image_fallback(&self) {
        // Minimal constant image: the crash flag is what next launch needs.
        let fallback = b"{\"version\":1,\"crashedLastLaunch\":true,\
            \"activeDurationSinceLastCrash\":0,\
            \"backgroundDurationSinceLastCrash\":0,\
            \"launchesSinceLastCrash\":1,\"sessionsSinceLastCrash\":1}";
        unsafe {
            let fd = libc::open(
                self.path_bytes.as_ptr() as *const libc::c_char,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                0o644,
            );
            if fd < 0 {
                return;
            }
            libc::write(fd, fallback.as_ptr() as *const libc::c_void, fallback.len());
            libc::close(fd);
        }
    }

    pub fn crashed_last_launch(&self) -> bool {
        self.state.lock().unwrap().crashed_last_launch
    }

    pub fn crashed_this_launch(&self) -> bool {
        self.state.lock().unwrap().crashed_this_launch
    }

    pub fn snapshot(&self) -> AppStateSnapshot {
        let state = self.state.lock().unwrap();
        Self::snapshot_of(&state)
    }

    /// Non-blocking snapshot for the capture path: a peer suspended while
    /// holding the state lock must not be able to wedge the fault handler.
    pub fn try_snapshot(&self) -> Option<AppStateSnapshot> {
        let state = self.state.try_lock().ok()?;
        Some(Self::snapshot_of(&state))
    }

    fn snapshot_of(state: &AppState) -> AppStateSnapshot {
        let elapsed = state.transition_time.elapsed().as_secs_f64();
        let (active_extra, background_extra) = if state.application_is_active {
            (elapsed, 0.0)
        } else if state.application_is_in_foreground {
            (0.0, 0.0)
        } else {
            (0.0, elapsed)
        };
        AppStateSnapshot {
            active_duration_since_launch: state.active_duration_since_launch + active_extra,
            background_duration_since_launch: state.background_duration_since_launch
                + background_extra,
            active_duration_since_last_crash: state.active_duration_since_last_crash
                + active_extra,
            background_duration_since_last_crash: state.background_duration_since_last_crash
                + background_extra,
            launches_since_last_crash: state.launches_since_last_crash,
            sessions_since_last_crash: state.sessions_since_last_crash,
            sessions_since_launch: state.sessions_since_launch,
            application_is_active: state.application_is_active,
            application_is_in_foreground: state.application_is_in_foreground,
        }
    }

    fn persisted(&self, crashed: bool) -> PersistedState {
        let state = self.state.lock().unwrap();
        PersistedState {
            version: APP_STATE_VERSION,
            crashed_last_launch: crashed || state.crashed_this_launch,
            active_duration_since_last_crash: state.active_duration_since_last_crash,
            background_duration_since_last_crash: state.background_duration_since_last_crash,
            launches_since_last_crash: state.launches_since_last_crash,
            sessions_since_last_crash: state.sessions_since_last_crash,
        }
    }

    fn save(&self, crashed: bool) -> Result<(), StateError> {
        let persisted = self.persisted(crashed);
        let mut file = std::fs::File::create(&self.path)?;
        serde_json::to_writer(&mut file, &persisted)?;
        file.flush()?;
        Ok(())
    }

    /// Renders the crashed-state variant into the fixed buffer the crash
    /// path flushes. Called after every off-path mutation.
    fn render_crash_image(&self) {
        let persisted = self.persisted(true);
        let rendered = match serde_json::to_vec(&persisted) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("failed to render crash-state image: {e}");
                return;
            }
        };
        let mut image = self.crash_image.lock().unwrap();
        let len = rendered.len().min(CRASH_IMAGE_SIZE);
        image.0[..len].copy_from_slice(&rendered[..len]);
        image.1 = len;
    }
}

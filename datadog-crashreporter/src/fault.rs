// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The record a monitor hands to the dispatcher when it intercepts a fault.
//!
//! A `FaultContext` is the single hub between monitors and the report
//! writer: the triggering monitor fills it, the dispatcher's enrichment pass
//! mutates it, and the writer treats it as read-only. It is built on the
//! capture thread's stack, except for signal-context captures where the
//! stack cannot be trusted and a static slot is used instead (see
//! `monitors::signal`).

use crate::context::MachineContext;
use crate::monitors::MonitorType;
use crate::stack::StackCursor;
use crate::state::AppStateSnapshot;
use crate::system::SystemInfo;

/// What kind of fault is being captured.
///
/// `MachException` and `CppException` have no fault source on this
/// platform, but reports carrying them must remain representable so the
/// post-mortem tooling can be pointed at reports from builds that do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    MachException,
    Signal,
    CppException,
    LanguageException,
    MainThreadDeadlock,
    UserReported,
    Zombie,
    SystemSnapshot,
    AppStateSnapshot,
}

impl FaultKind {
    /// The monitor bit this kind belongs to, for mask membership tests.
    pub fn monitor_type(self) -> MonitorType {
        match self {
            FaultKind::MachException => MonitorType::MACH_EXCEPTION,
            FaultKind::Signal => MonitorType::SIGNAL,
            FaultKind::CppException => MonitorType::CPP_EXCEPTION,
            FaultKind::LanguageException => MonitorType::PANIC,
            FaultKind::MainThreadDeadlock => MonitorType::MAIN_THREAD_DEADLOCK,
            FaultKind::UserReported => MonitorType::USER_REPORTED,
            FaultKind::Zombie => MonitorType::ZOMBIE,
            FaultKind::SystemSnapshot => MonitorType::SYSTEM,
            FaultKind::AppStateSnapshot => MonitorType::APPLICATION_STATE,
        }
    }

    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            FaultKind::UserReported | FaultKind::SystemSnapshot | FaultKind::AppStateSnapshot
        )
    }
}

/// Per-kind payload. Fields not belonging to the active variant are
/// unrepresentable rather than merely unreadable.
///
/// Borrowed strings must outlive the writer's pass; every producing monitor
/// owns its strings for the duration of `handle_exception`.
#[derive(Debug, Clone, Copy, Default)]
pub enum FaultPayload<'a> {
    #[default]
    None,
    Signal {
        signum: i32,
        sigcode: i32,
    },
    Mach {
        exception: i32,
        code: i64,
        subcode: i64,
    },
    CppException {
        name: &'a str,
    },
    /// The language-runtime exception on this platform: a Rust panic.
    Panic {
        name: &'a str,
        message: &'a str,
        location: &'a str,
    },
    UserReported {
        name: &'a str,
        language: Option<&'a str>,
        line_of_code: Option<&'a str>,
        custom_stack: Option<&'a [usize]>,
    },
    Zombie {
        address: usize,
        name: &'a str,
        reason: &'a str,
    },
}

/// A 36-character lowercase hex identifier generated once per fault,
/// rendered into a fixed buffer so generation never allocates.
#[derive(Clone, Copy)]
pub struct EventId([u8; 36]);

impl EventId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let mut buf = [0u8; 36];
        uuid.hyphenated().encode_lower(&mut buf);
        Self(buf)
    }

    pub const fn zeroed() -> Self {
        Self([b'0'; 36])
    }

    pub fn as_str(&self) -> &str {
        // The buffer only ever holds hyphenated lowercase hex.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl std::fmt::Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct FaultContext<'a> {
    pub kind: FaultKind,
    pub event_id: EventId,
    /// Machine context of the offending thread. Null only for snapshot
    /// kinds that never reach the writer.
    pub offending_context: *const MachineContext,
    /// Pre-initialized cursor for the offending thread's stack.
    pub stack_cursor: *mut StackCursor,
    /// Address of the fault, 0 if unknown.
    pub fault_address: usize,
    /// Optional human-readable reason.
    pub crash_reason: Option<&'a str>,
    /// Whether `offending_context` registers reflect the moment of fault.
    /// False for user-reported captures, which snapshot a healthy thread.
    pub registers_are_valid: bool,
    /// Set by the dispatcher when a second fault interrupts a capture.
    pub crashed_during_crash_handling: bool,
    /// Set by the dispatcher for signal-context captures; restricts the
    /// writer to async-signal-safe calls.
    pub requires_async_safety: bool,
    /// Set for user-reported captures; inhibits the fatal side effects.
    pub is_user_reported: bool,
    /// When set, the writer records only the offending thread.
    pub omit_peer_threads: bool,
    pub payload: FaultPayload<'a>,
    /// Filled by the system monitor's enrichment pass.
    pub system: Option<&'a SystemInfo>,
    /// Filled by the application-state monitor's enrichment pass.
    pub app_state: Option<AppStateSnapshot>,
    /// Path of the captured console log, if any.
    pub console_log_path: Option<&'a str>,
}

impl<'a> FaultContext<'a> {
    pub fn new(kind: FaultKind) -> Self {
        Self {
            kind,
            event_id: EventId::generate(),
            offending_context: std::ptr::null(),
            stack_cursor: std::ptr::null_mut(),
            fault_address: 0,
            crash_reason: None,
            registers_are_valid: true,
            crashed_during_crash_handling: false,
            requires_async_safety: false,
            is_user_reported: false,
            omit_peer_threads: false,
            payload: FaultPayload::None,
            system: None,
            app_state: None,
            console_log_path: None,
        }
    }

    /// Variant used for the static signal-context slot; the event id is
    /// generated later, in the handler.
    pub const fn zeroed(kind: FaultKind) -> Self {
        Self {
            kind,
            event_id: EventId::zeroed(),
            offending_context: std::ptr::null(),
            stack_cursor: std::ptr::null_mut(),
            fault_address: 0,
            crash_reason: None,
            registers_are_valid: true,
            crashed_during_crash_handling: false,
            requires_async_safety: false,
            is_user_reported: false,
            omit_peer_threads: false,
            payload: FaultPayload::None,
            system: None,
            app_state: None,
            console_log_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_grammar() {
        let id = EventId::generate();
        let s = id.as_str();
        assert_eq!(s.len(), 36);
        for (i, c) in s.chars().enumerate() {
            if matches!(i, 8 | 13 | 18 | 23) {
                assert_eq!(c, '-');
            } else {
                assert!(c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
            }
        }
    }

    #[test]
    fn test_event_ids_unique() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_fatality_by_kind() {
        assert!(FaultKind::Signal.is_fatal());
        assert!(FaultKind::LanguageException.is_fatal());
        assert!(FaultKind::MainThreadDeadlock.is_fatal());
        assert!(!FaultKind::UserReported.is_fatal());
    }

    #[test]
    fn test_kind_maps_to_monitor_bit() {
        assert_eq!(FaultKind::Signal.monitor_type(), MonitorType::SIGNAL);
        assert_eq!(
            FaultKind::LanguageException.monitor_type(),
            MonitorType::PANIC
        );
    }
}

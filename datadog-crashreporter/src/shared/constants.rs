// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and wire-format constants shared by the capture path and the
//! post-mortem fixer.
//!
//! The JSON field names here are the compatibility surface of the on-disk
//! report: both the report writer and the fixer's path patterns refer to
//! them, so they live in one place.

/// Version string stamped into every report under `report.version`.
pub const REPORT_VERSION: &str = "3.1.0";

/// A full report with every section.
pub const REPORT_TYPE_STANDARD: &str = "standard";
/// The outer shell written when a second fault interrupts the first capture.
pub const REPORT_TYPE_MINIMAL: &str = "minimal";
/// A host-supplied report stored through the rotation store.
pub const REPORT_TYPE_CUSTOM: &str = "custom";

// Memory-content record types. These names are fixed by the report schema
// consumed by downstream decoders.
pub const MEM_TYPE_BLOCK: &str = "objc_block";
pub const MEM_TYPE_CLASS: &str = "objc_class";
pub const MEM_TYPE_NULL_POINTER: &str = "null_pointer";
pub const MEM_TYPE_OBJECT: &str = "objc_object";
pub const MEM_TYPE_STRING: &str = "string";
pub const MEM_TYPE_UNKNOWN: &str = "unknown";

// Error block types, keyed by the fault kind that produced the report.
pub const EXC_TYPE_MACH: &str = "mach";
pub const EXC_TYPE_SIGNAL: &str = "signal";
pub const EXC_TYPE_CPP_EXCEPTION: &str = "cpp_exception";
pub const EXC_TYPE_NSEXCEPTION: &str = "nsexception";
pub const EXC_TYPE_DEADLOCK: &str = "deadlock";
pub const EXC_TYPE_USER: &str = "user";

// Field names referenced by both the writer and the fixer's path patterns.
pub const FIELD_REPORT: &str = "report";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_RECRASH_REPORT: &str = "recrash_report";
pub const FIELD_CRASH: &str = "crash";
pub const FIELD_THREADS: &str = "threads";
pub const FIELD_BACKTRACE: &str = "backtrace";
pub const FIELD_CONTENTS: &str = "contents";
pub const FIELD_SYMBOL_NAME: &str = "symbol_name";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_CPP_EXCEPTION: &str = "cpp_exception";
pub const FIELD_NAME: &str = "name";

/// Upper bound on the number of threads recorded into a crashed
/// machine context. Threads beyond this are dropped from the snapshot.
pub const MAX_THREADS: usize = 100;

/// Frame count past which a stack walk is considered to have run off the
/// end of a corrupted or overflowed stack.
pub const STACK_OVERFLOW_THRESHOLD: usize = 150;

/// Default budget for recursive object introspection per root address.
/// Bounds cycle-induced runaway without needing a marker set.
pub const DEFAULT_MEMORY_SEARCH_DEPTH: i32 = 15;

/// Maximum number of instance fields enumerated per introspected object.
pub const MAX_IVARS: usize = 10;

/// Stack words examined behind the stack pointer during the
/// notable-address sweep and the raw stack dump. "Behind" respects the
/// architectural growth direction.
pub const STACK_SEARCH_BACK: usize = 20;
/// Stack words examined ahead of the stack pointer.
pub const STACK_SEARCH_FORWARD: usize = 10;

/// Byte cap when copying a runtime string into a memory-content record.
pub const OBJECT_STRING_COPY_MAX: usize = 200;

/// Byte cap (including terminator) for raw C strings found during the
/// notable-address sweep.
pub const CSTRING_COPY_MAX: usize = 512;

/// Default cap on reports kept by the rotation store.
pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;

/// Version gate for the persisted application-state file.
pub const APP_STATE_VERSION: u32 = 1;

/// Scratch sizes for the allocation-free JSON encoder.
pub const JSON_MAX_DEPTH: usize = 64;
pub const JSON_SCRATCH_SIZE: usize = 1024;

/// Longest report path the installer will prepare for the fault path.
pub const MAX_REPORT_PATH: usize = 512;

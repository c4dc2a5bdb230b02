// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-mortem report fixing: symbol demangling and timestamp
//! reformatting.
//!
//! The capture path emits raw mangled symbol names and integer epoch
//! timestamps because decoding either would be unsafe (or just wasteful)
//! inside a signal handler. This second pass runs at rest, with no
//! async-safety constraint, and rewrites exactly two families of leaves,
//! addressed by path patterns over the report's container structure:
//!
//! - timestamp fields become ISO-8601 UTC strings;
//! - symbol-name fields are demangled, primary demangler first, then the
//!   secondary.
//!
//! A pattern segment of `""` matches any object key or array index, so a
//! single pattern covers every backtrace frame of every thread. The fixer
//! is idempotent: a reformatted timestamp is no longer an integer and a
//! demangled name no longer demangles.

use crate::shared::constants::{
    FIELD_BACKTRACE, FIELD_CONTENTS, FIELD_CPP_EXCEPTION, FIELD_CRASH, FIELD_ERROR, FIELD_NAME,
    FIELD_RECRASH_REPORT, FIELD_REPORT, FIELD_SYMBOL_NAME, FIELD_THREADS, FIELD_TIMESTAMP,
};
use chrono::DateTime;
use serde_json::Value;
use symbolic_common::{Language, Name, NameMangling};
use symbolic_demangle::{Demangle, DemangleOptions};

/// Symbol decoding capability. The engine only ever asks "can you turn
/// this into something readable"; what languages that covers is the
/// implementation's business.
pub trait Demangler: Send + Sync {
    fn demangle(&self, mangled: &str) -> Option<String>;
}

/// Itanium C++ ABI names (`_Z...`).
pub struct CppDemangler;

impl Demangler for CppDemangler {
    fn demangle(&self, mangled: &str) -> Option<String> {
        let name = Name::new(mangled, NameMangling::Mangled, Language::Cpp);
        name.demangle(DemangleOptions::complete())
    }
}

/// Rust legacy (`_ZN...$`) and v0 (`_R...`) names.
pub struct RustDemangler;

impl Demangler for RustDemangler {
    fn demangle(&self, mangled: &str) -> Option<String> {
        let name = Name::new(mangled, NameMangling::Mangled, Language::Rust);
        name.demangle(DemangleOptions::complete())
    }
}

const DATE_PATHS: &[&[&str]] = &[
    &[FIELD_REPORT, FIELD_TIMESTAMP],
    &[FIELD_RECRASH_REPORT, FIELD_REPORT, FIELD_TIMESTAMP],
];

const SYMBOL_PATHS: &[&[&str]] = &[
    &[
        FIELD_CRASH,
        FIELD_THREADS,
        "",
        FIELD_BACKTRACE,
        FIELD_CONTENTS,
        "",
        FIELD_SYMBOL_NAME,
    ],
    &[
        FIELD_RECRASH_REPORT,
        FIELD_CRASH,
        FIELD_THREADS,
        "",
        FIELD_BACKTRACE,
        FIELD_CONTENTS,
        "",
        FIELD_SYMBOL_NAME,
    ],
    &[FIELD_CRASH, FIELD_ERROR, FIELD_CPP_EXCEPTION, FIELD_NAME],
    &[
        FIELD_RECRASH_REPORT,
        FIELD_CRASH,
        FIELD_ERROR,
        FIELD_CPP_EXCEPTION,
        FIELD_NAME,
    ],
];

pub struct ReportFixer {
    demanglers: Vec<Box<dyn Demangler>>,
}

impl Default for ReportFixer {
    fn default() -> Self {
        Self {
            demanglers: vec![Box::new(CppDemangler), Box::new(RustDemangler)],
        }
    }
}

impl ReportFixer {
    /// A fixer with a custom demangler chain, tried in order.
    pub fn with_demanglers(demanglers: Vec<Box<dyn Demangler>>) -> Self {
        Self { demanglers }
    }

    /// Rewrites `raw`, returning None when it does not parse as JSON,
    /// in which case the caller keeps the raw report unchanged.
    pub fn fix(&self, raw: &str) -> Option<String> {
        let mut value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                log::error!("could not decode report for fixing: {e}");
                return None;
            }
        };
        let mut path: Vec<String> = Vec::new();
        self.walk(&mut value, &mut path);
        serde_json::to_string(&value).ok()
    }

    /// Convenience wrapper applying the decode-failure contract.
    pub fn fix_or_raw<'a>(&self, raw: &'a str) -> std::borrow::Cow<'a, str> {
        match self.fix(raw) {
            Some(fixed) => std::borrow::Cow::Owned(fixed),
            None => std::borrow::Cow::Borrowed(raw),
        }
    }

    fn walk(&self, value: &mut Value, path: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if child.is_object() || child.is_array() {
                        path.push(key.clone());
                        self.walk(child, path);
                        path.pop();
                    } else {
                        self.fix_leaf(key, child, path);
                    }
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    if child.is_object() || child.is_array() {
                        // Array elements have no name; the wildcard
                        // segment stands in for the index.
                        path.push(String::new());
                        self.walk(child, path);
                        path.pop();
                    } else {
                        self.fix_leaf("", child, path);
                    }
                }
            }
            _ => {}
        }
    }

    fn fix_leaf(&self, key: &str, value: &mut Value, path: &[String]) {
        if matches_any(path, key, DATE_PATHS) {
            if let Some(seconds) = value.as_i64() {
                if let Some(when) = DateTime::from_timestamp(seconds, 0) {
                    *value = Value::String(when.format("%Y-%m-%dT%H:%M:%SZ").to_string());
                }
            }
            return;
        }
        if matches_any(path, key, SYMBOL_PATHS) {
            if let Some(symbol) = value.as_str() {
                if let Some(demangled) = self.try_demangle(symbol) {
                    *value = Value::String(demangled);
                }
            }
        }
    }

    fn try_demangle(&self, symbol: &str) -> Option<String> {
        for demangler in &self.demanglers {
            if let Some(out) = demangler.demangle(symbol) {
                if out != symbol {
                    return Some(out);
                }
            }
        }
        None
    }
}

fn matches_any(path: &[String], leaf: &str, patterns: &[&[&str]]) -> bool {
    patterns.iter().any(|p| matches_pattern(path, leaf, p))
}

fn matches_pattern(path: &[String], leaf: &str, pattern: &[&str]) -> bool {
    if pattern.len() != path.len() + 1 {
        return false;
    }
    for (segment, expected) in path.iter().zip(pattern) {
        if !expected.is_empty() && segment != expected {
            return false;
        }
    }
    let last = pattern[pattern.len() - 1];
    last.is_empty() || last == leaf
}

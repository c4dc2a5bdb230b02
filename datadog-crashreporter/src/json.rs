// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON encoder usable from a signal handler.
//!
//! serde_json is deliberately absent from the capture path: serialization
//! there must not allocate, and a half-written report must stay parseable up
//! to the truncation point. This encoder therefore works against a
//! caller-supplied sink with fixed-size state only:
//!
//! - a fixed-depth stack of container kinds with a needs-comma bit per
//!   level;
//! - a small scratch buffer for number and escape formatting;
//! - handwritten, locale-independent integer and float formatters (the
//!   libc formatting family is not async-signal-safe).
//!
//! Errors latch: once the sink rejects a write or the depth limit is hit,
//! every subsequent operation is a silent no-op. The capture path checks
//! [`JsonEncoder::has_failed`] at section boundaries rather than
//! propagating a `Result` through every frame of a stack walk.

use crate::shared::constants::{JSON_MAX_DEPTH, JSON_SCRATCH_SIZE};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonEncodeError {
    #[error("sink rejected a write")]
    SinkFailed,
    #[error("container depth limit exceeded")]
    TooDeep,
    #[error("end_container called with no open container")]
    NotInContainer,
}

/// Byte sink for the encoder. Returns false to reject a write, which
/// latches the encoder into its failed state.
pub trait JsonSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> bool;
}

impl JsonSink for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        self.extend_from_slice(bytes);
        true
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

pub struct JsonEncoder<'s, S: JsonSink> {
    sink: &'s mut S,
    stack: [(Container, bool); JSON_MAX_DEPTH],
    depth: usize,
    error: Option<JsonEncodeError>,
    in_streamed_string: bool,
}

impl<'s, S: JsonSink> JsonEncoder<'s, S> {
    pub fn new(sink: &'s mut S) -> Self {
        Self {
            sink,
            stack: [(Container::Object, false); JSON_MAX_DEPTH],
            depth: 0,
            error: None,
            in_streamed_string: false,
        }
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Access to the sink, for callers that flush at section boundaries.
    pub fn sink_mut(&mut self) -> &mut S {
        self.sink
    }

    pub fn finish(self) -> Result<(), JsonEncodeError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: JsonEncodeError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if !self.sink.write_bytes(bytes) {
            self.fail(JsonEncodeError::SinkFailed);
        }
    }

    /// Comma/name prelude for the next element at the current level.
    fn begin_element(&mut self, name: Option<&str>) {
        if self.error.is_some() {
            return;
        }
        if self.depth > 0 {
            let needs_comma = self.stack[self.depth - 1].1;
            if needs_comma {
                self.put(b",");
            } else {
                self.stack[self.depth - 1].1 = true;
            }
        }
        if let Some(name) = name {
            self.put_escaped(name.as_bytes());
            self.put(b":");
        }
    }

    pub fn begin_object(&mut self, name: Option<&str>) {
        self.open(name, Container::Object, b"{");
    }

    pub fn begin_array(&mut self, name: Option<&str>) {
        self.open(name, Container::Array, b"[");
    }

    fn open(&mut self, name: Option<&str>, kind: Container, token: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if self.depth >= JSON_MAX_DEPTH {
            self.fail(JsonEncodeError::TooDeep);
            return;
        }
        self.begin_element(name);
        self.put(token);
        self.stack[self.depth] = (kind, false);
        self.depth += 1;
    }

    pub fn end_container(&mut self) {
        if self.error.is_some() {
            return;
        }
        if self.depth == 0 {
            self.fail(JsonEncodeError::NotInContainer);
            return;
        }
        self.depth -= 1;
        match self.stack[self.depth].0 {
            Container::Object => self.put(b"}"),
            Container::Array => self.put(b"]"),
        }
    }

    pub fn add_null(&mut self, name: Option<&str>) {
        self.begin_element(name);
        self.put(b"null");
    }

    pub fn add_boolean(&mut self, name: Option<&str>, value: bool) {
        self.begin_element(name);
        self.put(if value { b"true" } else { b"false" });
    }

    pub fn add_integer(&mut self, name: Option<&str>, value: i64) {
        self.begin_element(name);
        let mut scratch = [0u8; 24];
        let len = format_i64(value, &mut scratch);
        self.put(&scratch[..len]);
    }

    pub fn add_unsigned(&mut self, name: Option<&str>, value: u64) {
        self.begin_element(name);
        let mut scratch = [0u8; 24];
        let len = format_u64(value, &mut scratch);
        self.put(&scratch[..len]);
    }

    /// Non-finite values are emitted as `null`; JSON has no spelling for
    /// them and a dead process cannot be asked to retry.
    pub fn add_floating_point(&mut self, name: Option<&str>, value: f64) {
        if !value.is_finite() {
            self.add_null(name);
            return;
        }
        self.begin_element(name);
        let mut scratch = [0u8; 40];
        let len = format_f64(value, &mut scratch);
        self.put(&scratch[..len]);
    }

    pub fn add_string(&mut self, name: Option<&str>, value: &str) {
        self.begin_element(name);
        self.put_escaped(value.as_bytes());
    }

    /// Adds a string from raw bytes gathered by the memory probe or the
    /// filesystem. Invalid UTF-8 sequences become replacement characters
    /// so the document stays well-encoded whatever the bytes were.
    pub fn add_string_bytes(&mut self, name: Option<&str>, value: &[u8]) {
        self.begin_element(name);
        self.put(b"\"");
        self.put_sanitized_body(value);
        self.put(b"\"");
    }

    fn put_sanitized_body(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.put_escaped_body(valid.as_bytes());
                    break;
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    self.put_escaped_body(valid);
                    self.put(b"\\ufffd");
                    let skip = error.error_len().unwrap_or(after.len()).max(1);
                    rest = &after[skip.min(after.len())..];
                }
            }
        }
    }

    /// Trusted raw JSON element. The caller guarantees `json` is a
    /// complete, valid value.
    pub fn add_raw_element(&mut self, name: Option<&str>, json: &str) {
        self.begin_element(name);
        self.put(json.as_bytes());
    }

    /// Splices pre-validated `"key":value` pairs into the currently open
    /// object, keeping comma state consistent for elements added after.
    pub fn add_raw_object_pairs(&mut self, pairs: &str) {
        if pairs.is_empty() {
            return;
        }
        self.begin_element(None);
        self.put(pairs.as_bytes());
    }

    /// Binary data as a JSON string of uppercase hex nibbles.
    pub fn add_data(&mut self, name: Option<&str>, data: &[u8]) {
        self.begin_element(name);
        self.put(b"\"");
        let mut scratch = [0u8; JSON_SCRATCH_SIZE];
        for chunk in data.chunks(JSON_SCRATCH_SIZE / 2) {
            let mut len = 0;
            for &b in chunk {
                scratch[len] = HEX_UPPER[(b >> 4) as usize];
                scratch[len + 1] = HEX_UPPER[(b & 0x0F) as usize];
                len += 2;
            }
            self.put(&scratch[..len]);
        }
        self.put(b"\"");
    }

    /// A 16-byte identifier in 8-4-4-4-12 lowercase hex form.
    pub fn add_uuid(&mut self, name: Option<&str>, bytes: &[u8; 16]) {
        self.begin_element(name);
        let mut scratch = [0u8; 38];
        scratch[0] = b'"';
        let mut at = 1;
        for (i, &b) in bytes.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                scratch[at] = b'-';
                at += 1;
            }
            scratch[at] = HEX_LOWER[(b >> 4) as usize];
            scratch[at + 1] = HEX_LOWER[(b & 0x0F) as usize];
            at += 2;
        }
        scratch[at] = b'"';
        at += 1;
        self.put(&scratch[..at]);
    }

    /// Opens a string element whose contents arrive in chunks via
    /// [`append_string_bytes`](Self::append_string_bytes). Used to inline
    /// the console log without staging it anywhere.
    pub fn begin_string(&mut self, name: Option<&str>) {
        self.begin_element(name);
        self.put(b"\"");
        self.in_streamed_string = true;
    }

    /// A multi-byte sequence split across two appends is rendered as
    /// replacement characters; the chunks arrive from read(2) and the
    /// encoder holds no carry-over state.
    pub fn append_string_bytes(&mut self, bytes: &[u8]) {
        if !self.in_streamed_string {
            return;
        }
        self.put_sanitized_body(bytes);
    }

    pub fn end_string(&mut self) {
        if !self.in_streamed_string {
            return;
        }
        self.in_streamed_string = false;
        self.put(b"\"");
    }

    /// Embeds the contents of `fd` as a trusted JSON subdocument. Used by
    /// the recrash path to nest the interrupted report. Reads through a
    /// stack buffer only.
    pub fn add_json_from_fd(&mut self, name: Option<&str>, fd: libc::c_int) {
        self.begin_element(name);
        let mut buf = [0u8; JSON_SCRATCH_SIZE];
        let mut wrote_anything = false;
        loop {
            // SAFETY: reading into a stack buffer we own.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            wrote_anything = true;
            self.put(&buf[..n as usize]);
        }
        if !wrote_anything {
            self.put(b"null");
        }
    }

    fn put_escaped(&mut self, bytes: &[u8]) {
        self.put(b"\"");
        self.put_escaped_body(bytes);
        self.put(b"\"");
    }

    fn put_escaped_body(&mut self, bytes: &[u8]) {
        let mut scratch = [0u8; JSON_SCRATCH_SIZE];
        let mut len = 0;
        for &b in bytes {
            // Worst case expansion is 6 bytes per input byte.
            if len + 6 > JSON_SCRATCH_SIZE {
                self.put(&scratch[..len]);
                len = 0;
            }
            match b {
                b'"' => {
                    scratch[len..len + 2].copy_from_slice(b"\\\"");
                    len += 2;
                }
                b'\\' => {
                    scratch[len..len + 2].copy_from_slice(b"\\\\");
                    len += 2;
                }
                b'\n' => {
                    scratch[len..len + 2].copy_from_slice(b"\\n");
                    len += 2;
                }
                b'\r' => {
                    scratch[len..len + 2].copy_from_slice(b"\\r");
                    len += 2;
                }
                b'\t' => {
                    scratch[len..len + 2].copy_from_slice(b"\\t");
                    len += 2;
                }
                0x08 => {
                    scratch[len..len + 2].copy_from_slice(b"\\b");
                    len += 2;
                }
                0x0C => {
                    scratch[len..len + 2].copy_from_slice(b"\\f");
                    len += 2;
                }
                b if b < 0x20 => {
                    scratch[len..len + 4].copy_from_slice(b"\\u00");
                    scratch[len + 4] = HEX_LOWER[(b >> 4) as usize];
                    scratch[len + 5] = HEX_LOWER[(b & 0x0F) as usize];
                    len += 6;
                }
                b => {
                    scratch[len] = b;
                    len += 1;
                }
            }
        }
        if len > 0 {
            self.put(&scratch[..len]);
        }
    }
}

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";
const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";

/// Formats `value` into `buf`, returning the byte length. `buf` must hold
/// at least 20 bytes.
pub fn format_u64(value: u64, buf: &mut [u8]) -> usize {
    let mut digits = [0u8; 20];
    let mut n = value;
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        n /= 10;
        count += 1;
        if n == 0 {
            break;
        }
    }
    for i in 0..count {
        buf[i] = digits[count - 1 - i];
    }
    count
}

/// Formats `value` into `buf`, returning the byte length. `buf` must hold
/// at least 21 bytes.
pub fn format_i64(value: i64, buf: &mut [u8]) -> usize {
    if value < 0 {
        buf[0] = b'-';
        // unsigned_abs handles i64::MIN.
        1 + format_u64(value.unsigned_abs(), &mut buf[1..])
    } else {
        format_u64(value as u64, buf)
    }
}

/// Locale-independent float formatter: decimal notation with up to nine
/// fractional digits, trailing zeros stripped. Values whose magnitude does
/// not fit the integral path fall back to exponent notation with the same
/// digit machinery. `buf` must hold at least 40 bytes; `value` must be
/// finite.
pub fn format_f64(value: f64, buf: &mut [u8]) -> usize {
    let mut at = 0;
    let mut v = value;
    if v < 0.0 {
        buf[0] = b'-';
        at = 1;
        v = -v;
    }
    if v == 0.0 {
        buf[at] = b'0';
        return at + 1;
    }

    if v >= 1e15 || v < 1e-6 {
        // Normalize into [1, 10) and print as m.mmmmmmme+xx.
        let mut exp = 0i32;
        while v >= 10.0 {
            v /= 10.0;
            exp += 1;
        }
        while v < 1.0 {
            v *= 10.0;
            exp -= 1;
        }
        at += format_decimal(v, &mut buf[at..]);
        buf[at] = b'e';
        at += 1;
        if exp < 0 {
            buf[at] = b'-';
            at += 1;
            exp = -exp;
        } else {
            buf[at] = b'+';
            at += 1;
        }
        at += format_u64(exp as u64, &mut buf[at..]);
        at
    } else {
        at + format_decimal(v, &mut buf[at..])
    }
}

fn format_decimal(v: f64, buf: &mut [u8]) -> usize {
    let int_part = v as u64;
    let mut at = format_u64(int_part, buf);
    let mut frac = v - int_part as f64;
    if frac <= 0.0 {
        return at;
    }
    // Nine fractional digits, rounded at the last.
    frac = (frac * 1e9).round();
    if frac >= 1e9 {
        // Rounded up into the next integer; redo the integral part.
        return format_u64(int_part + 1, buf);
    }
    let mut frac = frac as u64;
    if frac == 0 {
        return at;
    }
    buf[at] = b'.';
    at += 1;
    let mut digits = [0u8; 9];
    for i in (0..9).rev() {
        digits[i] = b'0' + (frac % 10) as u8;
        frac /= 10;
    }
    let mut last = 8;
    while last > 0 && digits[last] == b'0' {
        last -= 1;
    }
    buf[at..at + last + 1].copy_from_slice(&digits[..last + 1]);
    at + last + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut JsonEncoder<'_, Vec<u8>>)) -> String {
        let mut sink = Vec::new();
        let mut enc = JsonEncoder::new(&mut sink);
        f(&mut enc);
        assert!(!enc.has_failed());
        String::from_utf8(sink).unwrap()
    }

    #[test]
    fn test_object_with_scalars() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_string(Some("name"), "app");
            e.add_integer(Some("count"), -3);
            e.add_unsigned(Some("addr"), 18446744073709551615);
            e.add_boolean(Some("crashed"), true);
            e.add_null(Some("queue"));
            e.end_container();
        });
        assert_eq!(
            out,
            "{\"name\":\"app\",\"count\":-3,\"addr\":18446744073709551615,\
             \"crashed\":true,\"queue\":null}"
        );
        // Must parse.
        serde_json::from_str::<serde_json::Value>(&out).unwrap();
    }

    #[test]
    fn test_nested_arrays() {
        let out = encode(|e| {
            e.begin_array(None);
            e.add_integer(None, 1);
            e.begin_object(None);
            e.add_string(Some("k"), "v");
            e.end_container();
            e.add_integer(None, 2);
            e.end_container();
        });
        assert_eq!(out, "[1,{\"k\":\"v\"},2]");
    }

    #[test]
    fn test_string_escaping() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_string(Some("s"), "a\"b\\c\nd\te\u{1}");
            e.end_container();
        });
        assert_eq!(out, "{\"s\":\"a\\\"b\\\\c\\nd\\te\\u0001\"}");
        serde_json::from_str::<serde_json::Value>(&out).unwrap();
    }

    #[test]
    fn test_float_formatting() {
        let mut buf = [0u8; 40];
        let cases: &[(f64, &str)] = &[
            (0.0, "0"),
            (1.0, "1"),
            (-2.5, "-2.5"),
            (3.25, "3.25"),
            (100.125, "100.125"),
            (0.001, "0.001"),
        ];
        for (v, expect) in cases {
            let len = format_f64(*v, &mut buf);
            assert_eq!(std::str::from_utf8(&buf[..len]).unwrap(), *expect);
        }
    }

    #[test]
    fn test_float_scientific_range() {
        let mut buf = [0u8; 40];
        let len = format_f64(1e20, &mut buf);
        let s = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(s.starts_with('1') && s.contains("e+"), "got {s}");
        let parsed: f64 = s.parse().unwrap();
        assert!((parsed - 1e20).abs() / 1e20 < 1e-9);
    }

    #[test]
    fn test_non_finite_becomes_null() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_floating_point(Some("v"), f64::NAN);
            e.end_container();
        });
        assert_eq!(out, "{\"v\":null}");
    }

    #[test]
    fn test_data_as_uppercase_hex() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_data(Some("stack"), &[0xDE, 0xAD, 0xBE, 0xEF]);
            e.end_container();
        });
        assert_eq!(out, "{\"stack\":\"DEADBEEF\"}");
    }

    #[test]
    fn test_uuid_grammar() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_uuid(Some("id"), &[0xAB; 16]);
            e.end_container();
        });
        assert_eq!(
            out,
            "{\"id\":\"abababab-abab-abab-abab-abababababab\"}"
        );
    }

    #[test]
    fn test_string_bytes_sanitizes_invalid_utf8() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_string_bytes(Some("name"), b"lib\xFF\xFEc.so");
            e.end_container();
        });
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["name"], "lib\u{fffd}\u{fffd}c.so");
    }

    #[test]
    fn test_streamed_string() {
        let out = encode(|e| {
            e.begin_object(None);
            e.begin_string(Some("log"));
            e.append_string_bytes(b"line one\n");
            e.append_string_bytes(b"line \"two\"");
            e.end_string();
            e.end_container();
        });
        assert_eq!(out, "{\"log\":\"line one\\nline \\\"two\\\"\"}");
    }

    #[test]
    fn test_raw_object_pairs_preserve_commas() {
        let out = encode(|e| {
            e.begin_object(None);
            e.add_raw_object_pairs("\"team\":\"payments\"");
            e.add_integer(Some("after"), 1);
            e.end_container();
        });
        assert_eq!(out, "{\"team\":\"payments\",\"after\":1}");
    }

    #[test]
    fn test_sink_failure_latches() {
        struct FailingSink {
            budget: usize,
        }
        impl JsonSink for FailingSink {
            fn write_bytes(&mut self, bytes: &[u8]) -> bool {
                if bytes.len() > self.budget {
                    return false;
                }
                self.budget -= bytes.len();
                true
            }
        }
        let mut sink = FailingSink { budget: 4 };
        let mut enc = JsonEncoder::new(&mut sink);
        enc.begin_object(None);
        enc.add_string(Some("long key that will not fit"), "value");
        assert!(enc.has_failed());
        // Further operations must not panic or write.
        enc.add_integer(Some("x"), 1);
        enc.end_container();
        assert_eq!(enc.finish(), Err(JsonEncodeError::SinkFailed));
    }

    #[test]
    fn test_depth_limit_latches() {
        let mut sink = Vec::new();
        let mut enc = JsonEncoder::new(&mut sink);
        for _ in 0..JSON_MAX_DEPTH + 4 {
            enc.begin_array(None);
        }
        assert!(enc.has_failed());
        assert_eq!(enc.finish(), Err(JsonEncodeError::TooDeep));
    }

    #[test]
    fn test_unbalanced_end_latches() {
        let mut sink = Vec::new();
        let mut enc = JsonEncoder::new(&mut sink);
        enc.end_container();
        assert_eq!(enc.finish(), Err(JsonEncodeError::NotInContainer));
    }

    #[test]
    fn test_large_data_spans_scratch_chunks() {
        let data = vec![0x5A; JSON_SCRATCH_SIZE * 2];
        let out = encode(|e| {
            e.begin_object(None);
            e.add_data(Some("d"), &data);
            e.end_container();
        });
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        let hex = v["d"].as_str().unwrap();
        assert_eq!(hex.len(), data.len() * 2);
        assert!(hex.bytes().all(|b| b == b'5' || b == b'A'));
    }
}

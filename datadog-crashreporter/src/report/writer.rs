// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The report writer: drives the safe JSON encoder through the on-disk
//! report schema, from a `FaultContext`, using only async-signal-safe
//! syscalls.
//!
//! The writer flushes after every top-level section (report info, binary
//! images, process state, system, crash, user, debug), so a process that
//! dies mid-write leaves a file that is parseable up to the truncation
//! point. The sink is a fixed-buffer fd writer; nothing here allocates.

use crate::api::GlobalState;
use crate::context::{self, cpu, MachineContext};
use crate::fault::{FaultContext, FaultKind, FaultPayload};
use crate::introspect::{self, FieldInfo, FieldKind, ObjectClass};
use crate::json::{JsonEncoder, JsonSink};
use crate::memory;
use crate::monitors::signal::{signal_code_name, signal_name};
#[cfg(test)]
use crate::monitors::signal::SEGV_MAPERR;
use crate::shared::constants::*;
use crate::stack::StackCursor;

/// Fixed-buffer writer over a raw fd. write(2) only.
pub struct FdSink {
    fd: libc::c_int,
    buf: [u8; 1024],
    len: usize,
    failed: bool,
}

impl FdSink {
    /// Opens `path` (NUL-terminated bytes) for writing, truncating.
    pub fn create(path: &[u8]) -> Option<Self> {
        if path.last() != Some(&0) {
            return None;
        }
        // SAFETY: path is NUL-terminated.
        let fd = unsafe {
            libc::open(
                path.as_ptr() as *const libc::c_char,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                0o644,
            )
        };
        if fd < 0 {
            return None;
        }
        Some(Self {
            fd,
            buf: [0; 1024],
            len: 0,
            failed: false,
        })
    }

    pub fn flush(&mut self) -> bool {
        if self.failed {
            return false;
        }
        let mut at = 0usize;
        while at < self.len {
            // SAFETY: writing our own buffer to our own fd.
            let n = unsafe {
                libc::write(
                    self.fd,
                    self.buf.as_ptr().add(at) as *const libc::c_void,
                    self.len - at,
                )
            };
            if n <= 0 {
                self.failed = true;
                return false;
            }
            at += n as usize;
        }
        self.len = 0;
        true
    }

    pub fn close(mut self) {
        self.flush();
        // SAFETY: fd came from open above.
        unsafe { libc::close(self.fd) };
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

impl JsonSink for FdSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.failed {
            return false;
        }
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.buf.len() - self.len;
            if room == 0 {
                if !self.flush() {
                    return false;
                }
                continue;
            }
            let take = rest.len().min(room);
            self.buf[self.len..self.len + take].copy_from_slice(&rest[..take]);
            self.len += take;
            rest = &rest[take..];
        }
        true
    }
}

/// Handle the host's user-section callback writes through. Only element
/// operations: the surrounding object belongs to the writer.
pub struct UserSectionWriter<'a, 'b> {
    enc: &'a mut JsonEncoder<'b, FdSink>,
}

impl UserSectionWriter<'_, '_> {
    pub fn add_string(&mut self, name: &str, value: &str) {
        self.enc.add_string(Some(name), value);
    }
    pub fn add_integer(&mut self, name: &str, value: i64) {
        self.enc.add_integer(Some(name), value);
    }
    pub fn add_boolean(&mut self, name: &str, value: bool) {
        self.enc.add_boolean(Some(name), value);
    }
    pub fn add_floating_point(&mut self, name: &str, value: f64) {
        self.enc.add_floating_point(Some(name), value);
    }
    /// Trusted raw JSON element.
    pub fn add_raw_element(&mut self, name: &str, json: &str) {
        self.enc.add_raw_element(Some(name), json);
    }
}

fn now_epoch_seconds() -> i64 {
    // SAFETY: time(2) with a null argument.
    unsafe { libc::time(std::ptr::null_mut()) as i64 }
}

/// Writes the full standard report for `ctx` at `path` (NUL-terminated).
pub(crate) fn write_standard_report(ctx: &FaultContext, path: &[u8], global: &GlobalState) {
    let Some(mut sink) = FdSink::create(path) else {
        return;
    };
    {
        let mut enc = JsonEncoder::new(&mut sink);
        enc.begin_object(None);

        write_report_info(&mut enc, ctx, global, REPORT_TYPE_STANDARD);
        enc.sink_mut().flush();

        write_binary_images(&mut enc);
        enc.sink_mut().flush();

        write_process_state(&mut enc, ctx);
        enc.sink_mut().flush();

        write_system_section(&mut enc, ctx, global);
        enc.sink_mut().flush();

        enc.begin_object(Some(FIELD_CRASH));
        write_error_block(&mut enc, ctx);
        write_threads(&mut enc, ctx, global);
        enc.end_container();
        enc.sink_mut().flush();

        write_user_section(&mut enc, global);
        enc.sink_mut().flush();

        write_debug_section(&mut enc, ctx, global);

        enc.end_container();
        if enc.has_failed() {
            // The partial report stays on disk up to the last flush.
            crate::write_stderr("crash report writer: sink failed, report truncated\n");
        }
    }
    sink.close();
}

/// Writes the minimal recrash shell: the partial report of the first
/// capture is renamed aside, embedded as a subdocument, and removed.
pub(crate) fn write_recrash_report(ctx: &FaultContext, path: &[u8], global: &GlobalState) {
    let mut old_path = [0u8; MAX_REPORT_PATH + 4];
    let Some(len) = path.iter().position(|&b| b == 0) else {
        return;
    };
    if len + 5 > old_path.len() {
        return;
    }
    old_path[..len].copy_from_slice(&path[..len]);
    old_path[len..len + 5].copy_from_slice(b".old\0");

    // SAFETY: both paths are NUL-terminated.
    unsafe {
        if libc::rename(
            path.as_ptr() as *const libc::c_char,
            old_path.as_ptr() as *const libc::c_char,
        ) != 0
        {
            return;
        }
    }

    let Some(mut sink) = FdSink::create(path) else {
        return;
    };
    {
        let mut enc = JsonEncoder::new(&mut sink);
        enc.begin_object(None);
        write_report_info(&mut enc, ctx, global, REPORT_TYPE_MINIMAL);
        enc.sink_mut().flush();

        // SAFETY: old_path is NUL-terminated.
        let old_fd = unsafe {
            libc::open(old_path.as_ptr() as *const libc::c_char, libc::O_RDONLY)
        };
        if old_fd >= 0 {
            enc.add_json_from_fd(Some(FIELD_RECRASH_REPORT), old_fd);
            // SAFETY: fd from open above.
            unsafe { libc::close(old_fd) };
        } else {
            enc.add_null(Some(FIELD_RECRASH_REPORT));
        }
        enc.sink_mut().flush();

        enc.begin_object(Some(FIELD_CRASH));
        write_error_block(&mut enc, ctx);
        if !ctx.offending_context.is_null() {
            // SAFETY: the triggering monitor keeps the context alive.
            let mc = unsafe { &*ctx.offending_context };
            write_thread(&mut enc, ctx, mc, Some("crashed_thread"), 0, true, global);
        }
        enc.end_container();

        enc.end_container();
    }
    sink.close();

    // SAFETY: NUL-terminated.
    unsafe { libc::unlink(old_path.as_ptr() as *const libc::c_char) };
}

fn write_report_info<S: JsonSink>(
    enc: &mut JsonEncoder<'_, S>,
    ctx: &FaultContext,
    global: &GlobalState,
    report_type: &str,
) {
    enc.begin_object(Some(FIELD_REPORT));
    enc.add_string(Some("version"), REPORT_VERSION);
    enc.add_string(Some("id"), ctx.event_id.as_str());
    enc.add_string(Some("process_name"), &global.config.app_name);
    enc.add_integer(Some(FIELD_TIMESTAMP), now_epoch_seconds());
    enc.add_string(Some("type"), report_type);
    enc.end_container();
}

fn write_binary_images<S: JsonSink>(enc: &mut JsonEncoder<'_, S>) {
    enc.begin_array(Some("binary_images"));
    if let Some(table) = crate::report::images::image_table() {
        for i in 0..table.len() {
            let Some(image) = table.image_at(i) else {
                continue;
            };
            enc.begin_object(None);
            enc.add_unsigned(Some("image_addr"), image.base_address as u64);
            enc.add_unsigned(Some("image_size"), image.size as u64);
            enc.add_unsigned(Some("image_vmaddr"), image.vm_address as u64);
            enc.add_string_bytes(Some("name"), image.name_bytes());
            if image.build_id().is_empty() {
                // A uuid is promised for every image; an all-zero id marks
                // "build carried none".
                enc.add_data(Some("uuid"), &[0u8; 16]);
            } else {
                enc.add_data(Some("uuid"), image.build_id());
            }
            enc.add_string(Some("cpu_arch"), std::env::consts::ARCH);
            enc.end_container();
        }
    }
    enc.end_container();
}

fn write_process_state<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, _ctx: &FaultContext) {
    enc.begin_object(Some("process"));
    if crate::monitors::zombie_monitor_enabled() {
        if let Some((address, name, reason)) = introspect::last_deallocated_exception() {
            enc.begin_object(Some("last_dealloced_exception"));
            enc.add_unsigned(Some("address"), *address as u64);
            enc.add_string(Some("name"), name);
            enc.add_string(Some("reason"), reason);
            enc.end_container();
        }
    }
    enc.end_container();
}

fn write_system_section<S: JsonSink>(
    enc: &mut JsonEncoder<'_, S>,
    ctx: &FaultContext,
    global: &GlobalState,
) {
    let info = ctx.system.unwrap_or(&global.system);
    enc.begin_object(Some("system"));
    enc.add_string(Some("process_name"), &info.process_name);
    enc.add_unsigned(Some("process_id"), info.process_id as u64);
    enc.add_unsigned(Some("parent_process_id"), info.parent_process_id as u64);
    enc.add_string(Some("cpu_arch"), info.cpu_arch);
    enc.add_string(Some("machine"), &info.machine);
    enc.add_string(Some("kernel_version"), &info.kernel_version);
    enc.add_string(Some("system_name"), &info.os_type);
    enc.add_string(Some("system_version"), &info.os_version);
    enc.begin_object(Some("memory"));
    enc.add_unsigned(Some("size"), info.memory_size);
    enc.add_unsigned(Some("usable"), info.usable_memory);
    enc.add_unsigned(Some("free"), info.free_memory);
    enc.end_container();
    enc.add_unsigned(Some("page_size"), info.page_size);
    match &info.boot_time {
        Some(boot_time) => enc.add_string(Some("boot_time"), boot_time),
        None => enc.add_null(Some("boot_time")),
    }
    enc.add_string(Some("app_start_time"), &info.app_start_time);
    enc.add_string(Some("build_type"), info.build_type);
    enc.add_string(Some("executable_path"), &info.executable_path);
    if let Some(app_state) = &ctx.app_state {
        enc.begin_object(Some("application_stats"));
        enc.add_floating_point(
            Some("active_time_since_last_crash"),
            app_state.active_duration_since_last_crash,
        );
        enc.add_floating_point(
            Some("background_time_since_last_crash"),
            app_state.background_duration_since_last_crash,
        );
        enc.add_floating_point(
            Some("active_time_since_launch"),
            app_state.active_duration_since_launch,
        );
        enc.add_floating_point(
            Some("background_time_since_launch"),
            app_state.background_duration_since_launch,
        );
        enc.add_unsigned(
            Some("launches_since_last_crash"),
            app_state.launches_since_last_crash as u64,
        );
        enc.add_unsigned(
            Some("sessions_since_last_crash"),
            app_state.sessions_since_last_crash as u64,
        );
        enc.add_unsigned(
            Some("sessions_since_launch"),
            app_state.sessions_since_launch as u64,
        );
        enc.add_boolean(Some("application_active"), app_state.application_is_active);
        enc.add_boolean(
            Some("application_in_foreground"),
            app_state.application_is_in_foreground,
        );
        enc.end_container();
    }
    enc.end_container();
}

fn write_error_block<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, ctx: &FaultContext) {
    enc.begin_object(Some(FIELD_ERROR));
    enc.add_unsigned(Some("address"), ctx.fault_address as u64);
    if let Some(reason) = ctx.crash_reason {
        enc.add_string(Some("reason"), reason);
    }
    match ctx.payload {
        FaultPayload::Signal { signum, sigcode } => {
            enc.add_string(Some("type"), EXC_TYPE_SIGNAL);
            enc.begin_object(Some("signal"));
            enc.add_integer(Some("signal"), signum as i64);
            enc.add_string(Some("name"), signal_name(signum));
            enc.add_integer(Some("code"), sigcode as i64);
            enc.add_string(Some("code_name"), signal_code_name(signum, sigcode));
            enc.end_container();
        }
        FaultPayload::Mach {
            exception,
            code,
            subcode,
        } => {
            enc.add_string(Some("type"), EXC_TYPE_MACH);
            enc.begin_object(Some("mach"));
            enc.add_integer(Some("exception"), exception as i64);
            enc.add_integer(Some("code"), code);
            enc.add_integer(Some("subcode"), subcode);
            enc.end_container();
        }
        FaultPayload::CppException { name } => {
            enc.add_string(Some("type"), EXC_TYPE_CPP_EXCEPTION);
            enc.begin_object(Some(FIELD_CPP_EXCEPTION));
            enc.add_string(Some(FIELD_NAME), name);
            enc.end_container();
        }
        FaultPayload::Panic {
            name,
            message,
            location,
        } => {
            enc.add_string(Some("type"), EXC_TYPE_NSEXCEPTION);
            enc.begin_object(Some("nsexception"));
            enc.add_string(Some(FIELD_NAME), name);
            enc.add_string(Some("reason"), message);
            if !location.is_empty() {
                enc.add_string(Some("userInfo"), location);
            }
            enc.end_container();
        }
        FaultPayload::UserReported {
            name,
            language,
            line_of_code,
            custom_stack,
        } => {
            enc.add_string(Some("type"), EXC_TYPE_USER);
            enc.begin_object(Some("user_reported"));
            enc.add_string(Some(FIELD_NAME), name);
            if let Some(language) = language {
                enc.add_string(Some("language"), language);
            }
            if let Some(line_of_code) = line_of_code {
                enc.add_string(Some("line_of_code"), line_of_code);
            }
            if let Some(custom_stack) = custom_stack {
                enc.begin_array(Some("backtrace"));
                for address in custom_stack {
                    enc.add_unsigned(None, *address as u64);
                }
                enc.end_container();
            }
            enc.end_container();
        }
        FaultPayload::Zombie {
            address,
            name,
            reason,
        } => {
            enc.add_string(Some("type"), EXC_TYPE_NSEXCEPTION);
            enc.begin_object(Some("nsexception"));
            enc.add_unsigned(Some("address"), address as u64);
            enc.add_string(Some(FIELD_NAME), name);
            enc.add_string(Some("reason"), reason);
            enc.end_container();
        }
        FaultPayload::None => {
            let type_name = match ctx.kind {
                FaultKind::MainThreadDeadlock => EXC_TYPE_DEADLOCK,
                _ => EXC_TYPE_SIGNAL,
            };
            enc.add_string(Some("type"), type_name);
        }
    }
    enc.end_container();
}

fn write_threads<S: JsonSink>(
    enc: &mut JsonEncoder<'_, S>,
    ctx: &FaultContext,
    global: &GlobalState,
) {
    enc.begin_array(Some(FIELD_THREADS));
    if ctx.offending_context.is_null() {
        enc.end_container();
        return;
    }
    // SAFETY: the triggering monitor keeps the context alive for the pass.
    let offending = unsafe { &*ctx.offending_context };

    if ctx.omit_peer_threads || offending.thread_count() == 0 {
        write_thread(enc, ctx, offending, None, 0, true, global);
        enc.end_container();
        return;
    }

    for index in 0..offending.thread_count() {
        let Some(tid) = offending.thread_at(index) else {
            continue;
        };
        if tid == offending.this_thread {
            write_thread(enc, ctx, offending, None, index, true, global);
        } else {
            let mut peer = MachineContext::zeroed();
            context::get_context_for_thread(tid, &mut peer, false);
            write_thread(enc, ctx, &peer, None, index, false, global);
        }
    }
    enc.end_container();
}

fn write_thread<S: JsonSink>(
    enc: &mut JsonEncoder<'_, S>,
    ctx: &FaultContext,
    mc: &MachineContext,
    name: Option<&str>,
    index: usize,
    crashed: bool,
    global: &GlobalState,
) {
    enc.begin_object(name);

    // Backtrace: the crashed thread re-walks the pre-initialized cursor;
    // peers get a fresh walk from their parked registers.
    enc.begin_object(Some(FIELD_BACKTRACE));
    enc.begin_array(Some(FIELD_CONTENTS));
    if crashed && !ctx.stack_cursor.is_null() {
        // SAFETY: the cursor lives in the capture slots / caller frame.
        let cursor = unsafe { &mut *ctx.stack_cursor };
        write_backtrace_frames(enc, cursor);
    } else if mc.has_regs {
        let mut cursor = StackCursor::from_machine_context(mc, STACK_OVERFLOW_THRESHOLD);
        write_backtrace_frames(enc, &mut cursor);
    }
    enc.end_container();
    enc.add_integer(Some("skipped"), 0);
    enc.end_container();

    let write_registers = mc.has_regs && (!crashed || ctx.registers_are_valid);
    if write_registers {
        enc.begin_object(Some("registers"));
        enc.begin_object(Some("basic"));
        for i in 0..cpu::register_count() {
            enc.add_unsigned(Some(cpu::register_name(i)), cpu::register_value(&mc.regs, i));
        }
        enc.end_container();
        if context::has_valid_exception_registers(mc) {
            enc.begin_object(Some("exception"));
            for i in 0..cpu::exception_register_count() {
                enc.add_unsigned(
                    Some(cpu::exception_register_name(i)),
                    cpu::exception_register_value(&mc.regs, i),
                );
            }
            enc.end_container();
        }
        enc.end_container();
    }

    enc.add_integer(Some("index"), index as i64);
    let mut name_buf = [0u8; 64];
    let name_len = context::thread_name(mc.this_thread, &mut name_buf);
    if name_len > 0 {
        enc.add_string_bytes(Some("name"), &name_buf[..name_len]);
    }
    enc.add_boolean(Some("crashed"), crashed);
    enc.add_boolean(Some("current_thread"), mc.this_thread == context::gettid());

    if crashed && write_registers {
        write_stack_dump(enc, mc);
        if global.config.introspect_memory {
            write_notable_addresses(enc, mc);
        }
    }

    enc.end_container();
}

fn write_backtrace_frames<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, cursor: &mut StackCursor) {
    while cursor.advance() {
        cursor.symbolicate();
        let frame = cursor.frame();
        enc.begin_object(None);
        enc.add_unsigned(Some("instruction_addr"), frame.instruction_address as u64);
        if frame.image_address != 0 {
            enc.add_unsigned(Some("object_addr"), frame.image_address as u64);
        }
        if let Some(name) = cstr_bytes(frame.image_name) {
            enc.add_string_bytes(Some("object_name"), basename(name));
        }
        if frame.symbol_address != 0 {
            enc.add_unsigned(Some("symbol_addr"), frame.symbol_address as u64);
        }
        if let Some(name) = cstr_bytes(frame.symbol_name) {
            enc.add_string_bytes(Some(FIELD_SYMBOL_NAME), name);
        }
        enc.end_container();
    }
}

fn write_stack_dump<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, mc: &MachineContext) {
    let word = std::mem::size_of::<usize>();
    let sp = cpu::stack_pointer(&mc.regs);
    if sp == 0 {
        return;
    }
    // "Back" is in the direction of growth (newer data); the stack grows
    // down on both supported architectures.
    let start = sp.saturating_sub(STACK_SEARCH_BACK * word);
    let end = sp.saturating_add(STACK_SEARCH_FORWARD * word);
    let mut dump = [0u8; (STACK_SEARCH_BACK + STACK_SEARCH_FORWARD) * 8];
    let len = (end - start).min(dump.len());
    if !memory::copy_safely(start, &mut dump[..len]) {
        return;
    }
    enc.begin_object(Some("stack"));
    enc.add_string(Some("grow_direction"), if cpu::stack_grows_down() { "-" } else { "+" });
    enc.add_unsigned(Some("dump_start"), start as u64);
    enc.add_unsigned(Some("dump_end"), end as u64);
    enc.add_unsigned(Some("stack_pointer"), sp as u64);
    enc.add_boolean(Some("overflow"), mc.is_stack_overflow);
    enc.add_data(Some(FIELD_CONTENTS), &dump[..len]);
    enc.end_container();
}

fn write_notable_addresses<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, mc: &MachineContext) {
    enc.begin_object(Some("notable_addresses"));

    for i in 0..cpu::register_count() {
        let value = cpu::register_value(&mc.regs, i) as usize;
        if is_notable_address(value) {
            write_memory_contents(
                enc,
                Some(cpu::register_name(i)),
                value,
                DEFAULT_MEMORY_SEARCH_DEPTH,
            );
        }
    }

    let word = std::mem::size_of::<usize>();
    let sp = cpu::stack_pointer(&mc.regs);
    if sp != 0 {
        let start = sp.saturating_sub(STACK_SEARCH_BACK * word);
        for slot in 0..(STACK_SEARCH_BACK + STACK_SEARCH_FORWARD) {
            let at = start + slot * word;
            let mut raw = [0u8; 8];
            if !memory::copy_safely(at, &mut raw[..word]) {
                continue;
            }
            let value = usize::from_ne_bytes(raw);
            if is_notable_address(value) {
                // stack@0x<slot address> keys each entry.
                let mut key = [0u8; 26];
                let key_len = format_stack_key(at, &mut key);
                if let Ok(key) = std::str::from_utf8(&key[..key_len]) {
                    write_memory_contents(enc, Some(key), value, DEFAULT_MEMORY_SEARCH_DEPTH);
                }
            }
        }
    }
    enc.end_container();
}

fn format_stack_key(address: usize, buf: &mut [u8; 26]) -> usize {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    buf[..8].copy_from_slice(b"stack@0x");
    let mut at = 8;
    let mut started = false;
    for shift in (0..(usize::BITS / 4)).rev() {
        let nibble = (address >> (shift * 4)) & 0xF;
        if nibble != 0 || started || shift == 0 {
            buf[at] = HEX[nibble];
            at += 1;
            started = true;
        }
    }
    at
}

/// A value is notable when it points at something we can say anything
/// about: a runtime object, a zombie, or a printable C string.
fn is_notable_address(address: usize) -> bool {
    if address == 0 || address < page_size::get() {
        return false;
    }
    if crate::monitors::zombie_monitor_enabled() && introspect::is_zombie(address) {
        return true;
    }
    if let Some(introspector) = introspect::introspector() {
        if introspector.classify(address) != ObjectClass::NotAnObject {
            return true;
        }
    }
    memory::is_valid_null_terminated_utf8(address, 4, CSTRING_COPY_MAX)
}

/// Records the contents of one address as a memory-content sub-record.
///
/// `remaining` is the introspection budget for this root, decremented on
/// the way down the recursion; it bounds cycle-induced runaway without a
/// marker set.
fn write_memory_contents<S: JsonSink>(
    enc: &mut JsonEncoder<'_, S>,
    key: Option<&str>,
    address: usize,
    remaining: i32,
) {
    enc.begin_object(key);
    enc.add_unsigned(Some("address"), address as u64);

    if address == 0 {
        enc.add_string(Some("type"), MEM_TYPE_NULL_POINTER);
        enc.end_container();
        return;
    }

    // Recently-deallocated objects are recorded first: classification of
    // a dead object is garbage anyway.
    let mut zombie_name = [0u8; 128];
    let zombie_len = if crate::monitors::zombie_monitor_enabled() {
        introspect::zombie_class_name(address, &mut zombie_name)
    } else {
        0
    };
    if zombie_len > 0 {
        enc.add_string_bytes(Some("last_deallocated_obj"), &zombie_name[..zombie_len]);
    }

    let classification = introspect::introspector()
        .map(|i| i.classify(address))
        .unwrap_or(ObjectClass::NotAnObject);

    match classification {
        ObjectClass::NotAnObject => {
            if zombie_len == 0 && memory::is_valid_null_terminated_utf8(address, 4, CSTRING_COPY_MAX)
            {
                let mut value = [0u8; CSTRING_COPY_MAX];
                if let Some(len) = memory::copy_string_safely(address, &mut value) {
                    enc.add_string(Some("type"), MEM_TYPE_STRING);
                    enc.add_string_bytes(Some("value"), &value[..len]);
                } else {
                    enc.add_string(Some("type"), MEM_TYPE_UNKNOWN);
                }
            } else {
                enc.add_string(Some("type"), MEM_TYPE_UNKNOWN);
            }
        }
        ObjectClass::OpaqueClass => {
            enc.add_string(Some("type"), MEM_TYPE_CLASS);
            write_class_name(enc, address);
        }
        ObjectClass::Block => {
            enc.add_string(Some("type"), MEM_TYPE_BLOCK);
            write_class_name(enc, address);
        }
        ObjectClass::TaggedPointer => {
            enc.add_string(Some("type"), MEM_TYPE_OBJECT);
            write_class_name(enc, address);
            if let Some(payload) =
                introspect::introspector().and_then(|i| i.tagged_payload(address))
            {
                enc.add_unsigned(Some("tagged_payload"), payload);
            }
        }
        ObjectClass::String | ObjectClass::Url => {
            enc.add_string(Some("type"), MEM_TYPE_STRING);
            write_class_name(enc, address);
            let mut value = [0u8; OBJECT_STRING_COPY_MAX];
            if let Some(introspector) = introspect::introspector() {
                let len = introspector.copy_string(address, &mut value);
                if len > 0 {
                    enc.add_string_bytes(Some("value"), &value[..len.min(value.len())]);
                }
            }
        }
        ObjectClass::Date => {
            enc.add_string(Some("type"), MEM_TYPE_OBJECT);
            write_class_name(enc, address);
            if let Some(value) = introspect::introspector().and_then(|i| i.date_value(address)) {
                enc.add_floating_point(Some("value"), value);
            }
        }
        ObjectClass::Number => {
            enc.add_string(Some("type"), MEM_TYPE_OBJECT);
            write_class_name(enc, address);
            if let Some(value) = introspect::introspector().and_then(|i| i.number_value(address))
            {
                enc.add_floating_point(Some("value"), value);
            }
        }
        ObjectClass::Array => {
            enc.add_string(Some("type"), MEM_TYPE_OBJECT);
            write_class_name(enc, address);
            if remaining > 0 {
                if let Some(first) =
                    introspect::introspector().and_then(|i| i.array_first_element(address))
                {
                    write_memory_contents(enc, Some("first_object"), first, remaining - 1);
                }
            }
        }
        ObjectClass::Dictionary | ObjectClass::Exception | ObjectClass::UnknownRuntimeObject => {
            enc.add_string(Some("type"), MEM_TYPE_OBJECT);
            let introspectable = write_class_name(enc, address);
            if remaining > 0 && introspectable {
                write_ivars(enc, address, remaining);
            }
        }
    }
    enc.end_container();
}

/// Writes the class name; returns whether the class may be introspected
/// further per the do-not-introspect rules.
fn write_class_name<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, address: usize) -> bool {
    let Some(introspector) = introspect::introspector() else {
        return false;
    };
    let mut name = [0u8; 128];
    let len = introspector.class_name(address, &mut name);
    if len == 0 {
        return true;
    }
    let name = &name[..len.min(128)];
    enc.add_string_bytes(Some("class"), name);
    introspect::should_introspect_class(name)
}

fn write_ivars<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, address: usize, remaining: i32) {
    let Some(introspector) = introspect::introspector() else {
        return;
    };
    let count = introspector.field_count(address).min(MAX_IVARS);
    if count == 0 {
        return;
    }
    enc.begin_object(Some("ivars"));
    for index in 0..count {
        let mut field = FieldInfo::zeroed();
        if !introspector.field(address, index, &mut field) {
            continue;
        }
        let mut name_buf = [0u8; 64];
        let name_len = field.name_bytes().len();
        name_buf[..name_len].copy_from_slice(field.name_bytes());
        let Ok(name) = std::str::from_utf8(&name_buf[..name_len]) else {
            continue;
        };
        match field.kind {
            FieldKind::Pointer(target) => {
                write_memory_contents(enc, Some(name), target, remaining - 1);
            }
            FieldKind::Int(value) => enc.add_integer(Some(name), value),
            FieldKind::Uint(value) => enc.add_unsigned(Some(name), value),
            FieldKind::Float(value) => enc.add_floating_point(Some(name), value),
            FieldKind::Bool(value) => enc.add_boolean(Some(name), value),
            FieldKind::Unknown => {
                enc.begin_object(Some(name));
                let tag = [field.type_tag()];
                enc.add_string_bytes(Some("type"), &tag);
                enc.end_container();
            }
        }
    }
    enc.end_container();
}

fn write_user_section(enc: &mut JsonEncoder<'_, FdSink>, global: &GlobalState) {
    enc.begin_object(Some("user"));
    if let Some(pairs) = global.user_info_pairs() {
        enc.add_raw_object_pairs(pairs);
    }
    if let Some(callback) = &global.config.user_section_write_callback {
        let mut writer = UserSectionWriter { enc };
        callback(&mut writer);
    }
    enc.end_container();
}

fn write_debug_section<S: JsonSink>(
    enc: &mut JsonEncoder<'_, S>,
    ctx: &FaultContext,
    global: &GlobalState,
) {
    enc.begin_object(Some("debug"));
    if global.config.add_console_log_to_report {
        let path = ctx
            .console_log_path
            .or(global.console_log_path.as_deref());
        if let Some(path) = path {
            write_console_log(enc, path);
        }
    }
    enc.end_container();
}

fn write_console_log<S: JsonSink>(enc: &mut JsonEncoder<'_, S>, path: &str) {
    let mut path_buf = [0u8; MAX_REPORT_PATH];
    if path.len() + 1 > path_buf.len() {
        return;
    }
    path_buf[..path.len()].copy_from_slice(path.as_bytes());
    path_buf[path.len()] = 0;
    // SAFETY: NUL-terminated above.
    let fd = unsafe { libc::open(path_buf.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    if fd < 0 {
        return;
    }
    enc.begin_string(Some("console_log"));
    let mut buf = [0u8; 512];
    loop {
        // SAFETY: reading into our own buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        enc.append_string_bytes(&buf[..n as usize]);
    }
    enc.end_string();
    // SAFETY: fd from open above.
    unsafe { libc::close(fd) };
}

fn cstr_bytes(ptr: *const libc::c_char) -> Option<&'static [u8]> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: pointers come from dladdr and reference linker-owned data.
    let bytes = unsafe { std::ffi::CStr::from_ptr(ptr) }.to_bytes();
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(at) => &path[at + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::MonitorType;
    use crate::shared::configuration::CrashReporterConfiguration;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_global(dir: &TempDir) -> GlobalState {
        let config = CrashReporterConfiguration::new(
            dir.path().to_path_buf(),
            "writer-test".to_string(),
            MonitorType::NONE,
        )
        .unwrap();
        GlobalState::new(config).unwrap()
    }

    fn nul_path(dir: &TempDir, name: &str) -> Vec<u8> {
        let mut bytes = dir
            .path()
            .join(name)
            .as_os_str()
            .as_encoded_bytes()
            .to_vec();
        bytes.push(0);
        bytes
    }

    fn write_and_parse(
        ctx: &FaultContext,
        global: &GlobalState,
        dir: &TempDir,
    ) -> serde_json::Value {
        crate::report::images::refresh_image_table();
        let path = nul_path(dir, "out.json");
        write_standard_report(ctx, &path, global);
        let raw = std::fs::read_to_string(dir.path().join("out.json")).unwrap();
        serde_json::from_str(&raw).expect("report must be valid JSON")
    }

    fn user_ctx<'a>(cursor: &'a mut StackCursor, mc: &'a MachineContext) -> FaultContext<'a> {
        let mut ctx = FaultContext::new(FaultKind::UserReported);
        ctx.offending_context = mc;
        ctx.stack_cursor = cursor;
        ctx.registers_are_valid = false;
        ctx.is_user_reported = true;
        ctx.omit_peer_threads = true;
        ctx.payload = FaultPayload::UserReported {
            name: "TestFault",
            language: Some("rust"),
            line_of_code: None,
            custom_stack: None,
        };
        ctx
    }

    #[test]
    fn test_standard_report_outer_shape() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);
        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[0x1000, 0x2000]);
        let ctx = user_ctx(&mut cursor, &mc);

        let report = write_and_parse(&ctx, &global, &dir);
        assert_eq!(report["report"]["version"], REPORT_VERSION);
        assert_eq!(report["report"]["type"], "standard");
        assert_eq!(report["report"]["process_name"], "writer-test");
        assert_eq!(report["report"]["id"].as_str().unwrap().len(), 36);
        assert!(report["report"]["timestamp"].is_i64());
        assert!(report["binary_images"].is_array());
        assert!(report["process"].is_object());
        assert!(report["system"].is_object());
        assert!(report["crash"]["error"].is_object());
        assert!(report["crash"]["threads"].is_array());
        assert!(report["user"].is_object());
        assert!(report["debug"].is_object());
    }

    #[test]
    fn test_binary_images_include_executable() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);
        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[]);
        let ctx = user_ctx(&mut cursor, &mc);

        let report = write_and_parse(&ctx, &global, &dir);
        let images = report["binary_images"].as_array().unwrap();
        assert!(!images.is_empty());
        for image in images {
            assert!(image["image_addr"].is_u64());
            assert!(image["uuid"].is_string());
            assert!(!image["uuid"].as_str().unwrap().is_empty());
        }
        let exe = std::env::current_exe().unwrap();
        let exe_name = exe.file_name().unwrap().to_str().unwrap();
        assert!(
            images
                .iter()
                .any(|i| i["name"].as_str().unwrap_or("").contains(exe_name)),
            "executable image must be present"
        );
    }

    #[test]
    fn test_user_error_block_and_single_crashed_thread() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);
        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[0xAAAA, 0xBBBB]);
        let ctx = user_ctx(&mut cursor, &mc);

        let report = write_and_parse(&ctx, &global, &dir);
        assert_eq!(report["crash"]["error"]["type"], "user");
        assert_eq!(report["crash"]["error"]["user_reported"]["name"], "TestFault");
        assert_eq!(
            report["crash"]["error"]["user_reported"]["language"],
            "rust"
        );
        let threads = report["crash"]["threads"].as_array().unwrap();
        let crashed: Vec<_> = threads
            .iter()
            .filter(|t| t["crashed"] == true)
            .collect();
        assert_eq!(crashed.len(), 1);
        let contents = crashed[0]["backtrace"]["contents"].as_array().unwrap();
        assert_eq!(contents[0]["instruction_addr"], 0xAAAA);
        assert_eq!(contents[1]["instruction_addr"], 0xBBBB);
        assert_eq!(crashed[0]["backtrace"]["skipped"], 0);
    }

    #[test]
    fn test_signal_error_block() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);
        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[0x1]);
        let mut ctx = FaultContext::new(FaultKind::Signal);
        ctx.offending_context = &mc;
        ctx.stack_cursor = &mut cursor;
        ctx.registers_are_valid = false;
        ctx.omit_peer_threads = true;
        ctx.fault_address = 0;
        ctx.payload = FaultPayload::Signal {
            signum: libc::SIGSEGV,
            sigcode: SEGV_MAPERR,
        };

        let report = write_and_parse(&ctx, &global, &dir);
        let error = &report["crash"]["error"];
        assert_eq!(error["type"], "signal");
        assert_eq!(error["address"], 0);
        assert_eq!(error["signal"]["signal"], 11);
        assert_eq!(error["signal"]["name"], "SIGSEGV");
        assert_eq!(error["signal"]["code_name"], "SEGV_MAPERR");
    }

    #[test]
    fn test_user_section_pairs_and_callback() {
        let dir = TempDir::new().unwrap();
        let mut config = CrashReporterConfiguration::new(
            dir.path().to_path_buf(),
            "writer-test".to_string(),
            MonitorType::NONE,
        )
        .unwrap();
        config.user_info_json = Some("{\"team\":\"payments\"}".to_string());
        config.user_section_write_callback =
            Some(Arc::new(|w: &mut UserSectionWriter<'_, '_>| {
                w.add_string("deploy", "canary");
                w.add_integer("shard", 7);
            }));
        let global = GlobalState::new(config).unwrap();

        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[]);
        let ctx = user_ctx(&mut cursor, &mc);

        let report = write_and_parse(&ctx, &global, &dir);
        assert_eq!(report["user"]["team"], "payments");
        assert_eq!(report["user"]["deploy"], "canary");
        assert_eq!(report["user"]["shard"], 7);
    }

    #[test]
    fn test_stack_dump_and_registers_present_with_valid_regs() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);

        // A synthetic stack region the dump window can read.
        let stack_words = vec![0usize; 64];
        let sp = stack_words.as_ptr() as usize + 32 * std::mem::size_of::<usize>();

        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        mc.has_regs = true;
        set_sp(&mut mc, sp);
        let mut cursor = StackCursor::from_backtrace(&[0x1]);
        let mut ctx = FaultContext::new(FaultKind::Signal);
        ctx.offending_context = &mc;
        ctx.stack_cursor = &mut cursor;
        ctx.registers_are_valid = true;
        ctx.omit_peer_threads = true;
        ctx.payload = FaultPayload::Signal {
            signum: libc::SIGBUS,
            sigcode: 0,
        };

        let report = write_and_parse(&ctx, &global, &dir);
        let thread = &report["crash"]["threads"][0];
        assert!(thread["registers"]["basic"].is_object());
        let stack = &thread["stack"];
        assert_eq!(stack["grow_direction"], "-");
        assert_eq!(stack["stack_pointer"].as_u64().unwrap(), sp as u64);
        assert_eq!(stack["overflow"], false);
        let contents = stack["contents"].as_str().unwrap();
        assert!(contents.len() > 0 && contents.len() % 2 == 0);
        assert!(contents.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    struct FakeIntrospector {
        object: usize,
        text: usize,
    }

    impl crate::introspect::ObjectIntrospector for FakeIntrospector {
        fn classify(&self, address: usize) -> ObjectClass {
            if address == self.object {
                ObjectClass::UnknownRuntimeObject
            } else if address == self.text {
                ObjectClass::String
            } else {
                ObjectClass::NotAnObject
            }
        }
        fn class_name(&self, address: usize, buf: &mut [u8]) -> usize {
            let name: &[u8] = if address == self.object {
                b"OrderQueue"
            } else if address == self.text {
                b"Text"
            } else {
                return 0;
            };
            buf[..name.len()].copy_from_slice(name);
            name.len()
        }
        fn copy_string(&self, address: usize, buf: &mut [u8]) -> usize {
            if address == self.text {
                buf[..5].copy_from_slice(b"hello");
                5
            } else {
                0
            }
        }
        fn date_value(&self, _address: usize) -> Option<f64> {
            None
        }
        fn number_value(&self, _address: usize) -> Option<f64> {
            None
        }
        fn array_first_element(&self, _address: usize) -> Option<usize> {
            None
        }
        fn field_count(&self, address: usize) -> usize {
            if address == self.object {
                2
            } else {
                0
            }
        }
        fn field(&self, address: usize, index: usize, out: &mut FieldInfo) -> bool {
            if address != self.object {
                return false;
            }
            match index {
                0 => {
                    out.name[..5].copy_from_slice(b"depth");
                    out.name_len = 5;
                    out.kind = FieldKind::Int(42);
                    true
                }
                1 => {
                    out.name[..4].copy_from_slice(b"text");
                    out.name_len = 4;
                    out.kind = FieldKind::Pointer(self.text);
                    true
                }
                _ => false,
            }
        }
    }

    #[test]
    fn test_notable_addresses_with_introspector() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);

        // Fake object/string targets at distinctive addresses backed by
        // real allocations so probes succeed.
        let object_storage = vec![0u8; 64];
        let text_storage = b"hello\0".to_vec();
        let object = object_storage.as_ptr() as usize;
        let text = text_storage.as_ptr() as usize;
        crate::introspect::install_introspector(Box::new(FakeIntrospector { object, text }));

        // A C string and the fake object reachable from the stack window.
        let c_string = b"notable stack string\0".to_vec();
        let mut stack_words = vec![0usize; 64];
        stack_words[30] = c_string.as_ptr() as usize;
        stack_words[31] = object;
        let sp = stack_words.as_ptr() as usize + 28 * std::mem::size_of::<usize>();

        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        mc.has_regs = true;
        set_sp(&mut mc, sp);
        let mut cursor = StackCursor::from_backtrace(&[0x1]);
        let mut ctx = FaultContext::new(FaultKind::Signal);
        ctx.offending_context = &mc;
        ctx.stack_cursor = &mut cursor;
        ctx.registers_are_valid = true;
        ctx.omit_peer_threads = true;
        ctx.payload = FaultPayload::Signal {
            signum: libc::SIGSEGV,
            sigcode: 1,
        };

        let report = write_and_parse(&ctx, &global, &dir);
        let notable = report["crash"]["threads"][0]["notable_addresses"]
            .as_object()
            .expect("notable_addresses must be present");

        let allowed_types = [
            "objc_block",
            "objc_class",
            "null_pointer",
            "objc_object",
            "string",
            "unknown",
        ];
        let mut saw_cstring = false;
        let mut saw_object = false;
        for (key, record) in notable {
            let record_type = record["type"].as_str().unwrap();
            assert!(
                allowed_types.contains(&record_type),
                "unexpected type {record_type} at {key}"
            );
            if record_type == "string" {
                let value = record["value"].as_str().unwrap_or("");
                assert!(value.len() < 512);
                if value == "notable stack string" {
                    saw_cstring = true;
                }
            }
            if record["class"] == "OrderQueue" {
                saw_object = true;
                assert_eq!(record["ivars"]["depth"], 42);
                assert_eq!(record["ivars"]["text"]["value"], "hello");
            }
        }
        assert!(saw_cstring, "C string on the stack must be notable");
        assert!(saw_object, "runtime object on the stack must be notable");
        // Leave a null introspector behind for other tests.
        crate::introspect::install_introspector(Box::new(crate::introspect::NullIntrospector));
    }

    #[test]
    fn test_recrash_report_embeds_first_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let global = test_global(&dir);
        let path = nul_path(&dir, "report.json");

        // First capture: a standard report at the target path.
        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[0x10]);
        let ctx = user_ctx(&mut cursor, &mc);
        crate::report::images::refresh_image_table();
        write_standard_report(&ctx, &path, &global);

        // Second capture interrupts the first.
        let mut cursor2 = StackCursor::from_backtrace(&[0x20]);
        let mut ctx2 = FaultContext::new(FaultKind::Signal);
        ctx2.offending_context = &mc;
        ctx2.stack_cursor = &mut cursor2;
        ctx2.registers_are_valid = false;
        ctx2.crashed_during_crash_handling = true;
        ctx2.payload = FaultPayload::Signal {
            signum: libc::SIGSEGV,
            sigcode: 0,
        };
        write_recrash_report(&ctx2, &path, &global);

        let raw = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
        let report: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(report["report"]["type"], "minimal");
        assert_eq!(report["recrash_report"]["report"]["type"], "standard");
        assert!(report["crash"]["crashed_thread"].is_object());
        assert!(report["crash"]["error"].is_object());
        assert!(
            !dir.path().join("report.json.old").exists(),
            "the .old temporary must be gone"
        );
    }

    #[test]
    fn test_console_log_inlined_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = CrashReporterConfiguration::new(
            dir.path().to_path_buf(),
            "writer-test".to_string(),
            MonitorType::NONE,
        )
        .unwrap();
        config.add_console_log_to_report = true;
        let global = GlobalState::new(config).unwrap();
        std::fs::write(
            dir.path().join("console.log"),
            "boot ok\nready to \"serve\"\n",
        )
        .unwrap();

        let mut mc = MachineContext::zeroed();
        context::get_context_for_thread(context::gettid(), &mut mc, true);
        let mut cursor = StackCursor::from_backtrace(&[]);
        let ctx = user_ctx(&mut cursor, &mc);

        let report = write_and_parse(&ctx, &global, &dir);
        let console = report["debug"]["console_log"].as_str().unwrap();
        assert!(console.contains("boot ok"));
        assert!(console.contains("ready to \"serve\""));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename(b"/usr/lib/libc.so.6"), b"libc.so.6");
        assert_eq!(basename(b"binary"), b"binary");
        assert_eq!(basename(b"dir/"), b"");
    }

    fn set_sp(mc: &mut MachineContext, sp: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            mc.regs.gregs[libc::REG_RSP as usize] = sp as i64;
        }
        #[cfg(target_arch = "aarch64")]
        {
            mc.regs.sp = sp as u64;
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! PUBLIC API: log_* macros, emit(level,target,args), install_sink(), LogSink
//! DEPENDS_ON: spin::Once
//! INVARIANTS: Debug/Trace only in debug builds (or `debug_uart`); single-line
//!             emission; lines are dropped until a sink is installed

use core::fmt::Arguments;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(any(debug_assertions, feature = "debug_uart")),
            _ => true,
        }
    }
}

/// Destination of formatted log lines (UART on hardware, a buffer in tests).
pub trait LogSink: Sync {
    /// Writes one complete line, without the trailing newline.
    fn write_line(&self, line: Arguments<'_>);
}

static SINK: spin::Once<&'static dyn LogSink> = spin::Once::new();

/// Installs the process-wide sink. The first installation wins.
pub fn install_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write_line(format_args!("[{} {}] {}", level.tag(), target, args));
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Capture(spin::Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn write_line(&self, line: Arguments<'_>) {
            self.0.lock().push(line.to_string());
        }
    }

    static CAPTURE: Capture = Capture(spin::Mutex::new(Vec::new()));

    #[test]
    fn lines_carry_level_and_target() {
        install_sink(&CAPTURE);
        crate::log_warn!(target: "sched", "run-queue depth {}", 3);
        crate::log_debug!(target: "mm", "fault at {:#x}", 0x4000);
        let lines = CAPTURE.0.lock();
        assert!(lines.iter().any(|l| l == "[WARN sched] run-queue depth 3"));
        if cfg!(debug_assertions) {
            assert!(lines.iter().any(|l| l == "[DEBUG mm] fault at 0x4000"));
        }
    }
}

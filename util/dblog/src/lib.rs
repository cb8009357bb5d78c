// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Colored stdout logger for x-dbcore processes.
//!
//! Every process sets this up once at startup. Nothing in a signal-handler
//! path may log; the latch and wakeup-transport code honors that.

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};
pub use log::{debug, error, info, trace, warn};

mod tests;

macro_rules! color_fmt {
    ($color_code:expr, $($arg:tt)*) => {
        format_args!("\u{1B}[{}m{}\u{1B}[m", $color_code as u8, format_args!($($arg)*))
    };
}

#[repr(u8)]
#[allow(dead_code)]
enum AnsiColor {
    Red = 31,
    Green = 32,
    Yellow = 33,
    Cyan = 36,
    White = 37,
    BrightBlack = 90,
}

struct ProcessLogger;

impl Log for ProcessLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.level();
        let line = record.line().unwrap_or(0);
        let path = record.target();
        let color = match level {
            Level::Error => AnsiColor::Red,
            Level::Warn => AnsiColor::Yellow,
            Level::Info => AnsiColor::Green,
            Level::Debug => AnsiColor::Cyan,
            Level::Trace => AnsiColor::BrightBlack,
        };

        print_fmt(color_fmt!(
            AnsiColor::White,
            "[{time} {pid} {path}:{line}] {args}\n",
            time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            pid = std::process::id(),
            path = path,
            line = line,
            args = color_fmt!(color, "{}", record.args()),
        ));
    }

    fn flush(&self) {}
}

fn print_fmt(args: fmt::Arguments) {
    use std::io::Write;
    let _ = std::io::stdout().write_fmt(args);
}

static LOGGER: ProcessLogger = ProcessLogger;

/// Installs the process logger with the given maximum level.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(max_level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}

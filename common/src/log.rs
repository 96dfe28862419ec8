//! This workspace never pulls in a structured-logging framework — the
//! whole teacher workspace logs with `println!`/`eprintln!` plus
//! `owo_colors` coloring. The one piece of "structured logging" spec.md
//! §6 asks for is a `LOG_LEVEL` filter, so that's what this module adds:
//! a level check in front of the teacher's print-and-color idiom.

use owo_colors::OwoColorize;

use crate::config::LogLevel;

/// Prints `msg` in green if `level <= configured`, matching the
/// teacher's "🚀 started" / "🌱 starting" style status lines.
pub fn info(configured: LogLevel, msg: &str) {
    if configured >= LogLevel::Info {
        println!("{}", msg.green());
    }
}

pub fn debug(configured: LogLevel, msg: &str) {
    if configured >= LogLevel::Debug {
        println!("{}", msg.dimmed());
    }
}

pub fn warn(configured: LogLevel, msg: &str) {
    if configured >= LogLevel::Warn {
        eprintln!("{}", msg.yellow());
    }
}

/// Errors always print — there is no level below `error`.
pub fn error(msg: &str) {
    eprintln!("{}", msg.red());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_gates_as_expected() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }
}

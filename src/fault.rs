//! Process-fatal error reporting.
//!
//! The hot path has no error-return channel: anything that compromises the
//! arena/extent invariants ends the process, matching the contract the
//! compiler pass compiles against.

/// Reports a fatal condition and exits the process.
///
/// Kept out-of-line so the hot path only pays for a call on the doomed path.
#[cold]
pub(crate) fn report_fatal(msg: core::fmt::Arguments<'_>) -> ! {
    eprintln!("strata: {msg}; aborting");
    std::process::exit(1);
}

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fault::report_fatal(format_args!($($arg)*))
    };
}

pub(crate) use fatal;

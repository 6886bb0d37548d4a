//! The one way out for a lock found corrupted or misused: dump its header, then terminate.

use std::{
    fmt::{self, Display, Formatter, Write as _},
    io::{self, Write as _},
    panic::{self, AssertUnwindSafe},
    process,
};

use thiserror::Error;

use crate::header::LockHeader;

/// Target of the events describing a dumped lock.
pub const DUMP_TARGET: &str = "lock_diagnostics::dump";

const FORMAT_FAILED: &str = "<message formatting failed>";
const FORMAT_PANICKED: &str = "<message formatting panicked>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpField {
    pub label: &'static str,
    pub value: String,
}

/// Every field of a lock header, rendered for humans, in the order it is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDump {
    fields: Vec<DumpField>,
}

impl LockDump {
    pub fn capture(header: &LockHeader) -> Self {
        let snapshot = header.snapshot();
        let mut dump = LockDump { fields: Vec::new() };
        dump.push("lock @", format!("{header:p}"));
        dump.push("signature", snapshot.signature.to_string());
        dump.push("count", snapshot.count.to_string());
        dump.push("name", snapshot.name);
        dump.push("caller", snapshot.caller.to_string());
        dump.push("rank", snapshot.rank.to_string());
        dump.push("thread", snapshot.thread.to_string());
        dump
    }

    fn push(&mut self, label: &'static str, value: String) {
        self.fields.push(DumpField { label, value });
    }

    pub fn fields(&self) -> &[DumpField] {
        &self.fields
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.label == label)
            .map(|field| field.value.as_str())
    }

    fn emit(&self) {
        for field in &self.fields {
            tracing::warn!(
                target: DUMP_TARGET,
                field = field.label,
                value = %field.value,
                "{} {}",
                field.label,
                field.value
            );
        }
    }
}

impl Display for LockDump {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                f.write_char('\n')?;
            }
            write!(f, "{} {}", field.label, field.value)?;
        }
        Ok(())
    }
}

/// A lock invariant has been violated. Handed to a [`Terminator`], never returned to the lock user.
#[derive(Debug, Error)]
#[error("{message}\n{dump}")]
pub struct FatalError {
    pub message: String,
    pub dump: LockDump,
}

/// Turns a [`FatalError`] into the end of the process (or, for test harnesses, of the test).
pub trait Terminator: fmt::Debug + Send + Sync {
    fn terminate(&self, error: FatalError) -> !;
}

/// Writes the error to stderr and aborts the process. No unwinding, no destructors.
#[derive(Debug, Default, Clone, Copy)]
pub struct Abort;

impl Terminator for Abort {
    fn terminate(&self, error: FatalError) -> ! {
        // A panicking subscriber or a closed stderr must not keep us from aborting
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            tracing::error!(target: DUMP_TARGET, "{}", error.message);
            let _ = writeln!(io::stderr().lock(), "fatal lock error: {error}");
        }));
        process::abort()
    }
}

/// Raises the error as a panic carrying its rendered text. Lets tests observe a fatal report without
/// losing the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unwind;

impl Terminator for Unwind {
    fn terminate(&self, error: FatalError) -> ! {
        panic!("{error}")
    }
}

/// Dumps `header`, formats `args` and aborts the process.
///
/// Use this once a lock is known to be corrupted or misused. The header is not validated again, every
/// field is reported as found.
pub fn report_fatal(header: &LockHeader, args: fmt::Arguments<'_>) -> ! {
    report_fatal_with(header, args, &Abort)
}

/// Like [`report_fatal`], but lets `terminator` decide how to end things.
pub fn report_fatal_with(
    header: &LockHeader,
    args: fmt::Arguments<'_>,
    terminator: &dyn Terminator,
) -> ! {
    let dump = LockDump::capture(header);
    // Emitting is best effort, a panicking subscriber must not unwind past the terminator
    let _ = panic::catch_unwind(AssertUnwindSafe(|| dump.emit()));
    let message = render_message(args);
    terminator.terminate(FatalError { message, dump })
}

/// Formats as much of `args` as possible. Failing `Display` implementations must not keep us from
/// terminating.
fn render_message(args: fmt::Arguments<'_>) -> String {
    let mut message = String::new();
    match panic::catch_unwind(AssertUnwindSafe(|| message.write_fmt(args))) {
        Ok(Ok(())) => {}
        Ok(Err(_)) => message.push_str(FORMAT_FAILED),
        Err(_) => message.push_str(FORMAT_PANICKED),
    }
    message
}

/// Dumps a lock header and aborts with a formatted message.
///
/// ```no_run
/// use lock_diagnostics::{lock_fatal, LockHeader, Rank, Signature};
///
/// let header = LockHeader::new(Signature::RW_LOCK, "config", Rank(3));
/// lock_fatal!(&header, "released by thread {} which never acquired it", 7);
/// ```
#[macro_export]
macro_rules! lock_fatal {
    ($header:expr, $($arg:tt)+) => {
        $crate::report_fatal($header, ::core::format_args!($($arg)+))
    };
}

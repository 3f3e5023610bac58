//! Per-thread exception collection for the Qore runtime core.
//!
//! The core never unwinds the host language's call stack to propagate a
//! Qore-language exception: user-defined destructors run during reference
//! release and may themselves need to raise, which a stack-unwinding scheme
//! cannot express without double-faulting. Instead every fallible entry
//! point receives an [`ExceptionSink`] and appends to it; callers check
//! [`ExceptionSink::is_exception`] (or let a scoped holder do so) after any
//! call that could fail.
//!
//! The sink is generic over the description/argument payload type `V` so
//! that this crate has no dependency on the value model that lives above
//! it (see `qore-value`, which specializes `Exception<V>`/`ExceptionSink<V>`
//! over its `Value` type).

#![forbid(unsafe_code)]

use std::fmt;

/// Where in the source an exception (or the current evaluation) occurred.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            file: Some(file.into()),
            start_line,
            end_line,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) if self.start_line == self.end_line => {
                write!(f, "{file}:{}", self.start_line)
            }
            Some(file) => write!(f, "{file}:{}-{}", self.start_line, self.end_line),
            None => write!(f, "<unknown>"),
        }
    }
}

/// The provenance of a call-stack frame, mirroring how it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// An ordinary user-code call.
    User,
    /// A call into a builtin/native function.
    Builtin,
    /// Not the originating site: an annotation added by a catch-and-rethrow.
    Rethrow,
    /// The frame at which a new thread was spawned (background/start-thread).
    NewThread,
}

/// One entry in an exception's call-stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub class_name: Option<String>,
    pub file: Option<String>,
    pub line_range: (u32, u32),
    pub kind: FrameKind,
}

impl StackFrame {
    pub fn new(
        kind: FrameKind,
        class_name: Option<String>,
        function: impl Into<String>,
        file: Option<String>,
        start_line: u32,
        end_line: u32,
    ) -> Self {
        Self {
            function: function.into(),
            class_name,
            file,
            line_range: (start_line, end_line),
            kind,
        }
    }
}

/// Whether an exception originated from the runtime itself or from a
/// user `throw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    System,
    User,
}

/// A single in-flight Qore-language exception.
///
/// The call stack is built bottom-up: it starts empty at `raise` time and
/// gains one [`StackFrame`] per call level as the exception unwinds via
/// [`Exception::add_stack_info`], with catch-and-rethrow sites contributing
/// a [`FrameKind::Rethrow`] frame rather than a fresh originating one.
#[derive(Debug, Clone)]
pub struct Exception<V> {
    pub kind: ExceptionKind,
    /// The dash-separated error tag, e.g. `"DIVISION-BY-ZERO"`.
    pub err: String,
    pub description: V,
    pub arg: Option<V>,
    pub location: SourceLocation,
    pub call_stack: Vec<StackFrame>,
    /// The cause this exception wraps, when raised while another was in
    /// flight (a "chained" exception).
    pub next: Option<Box<Exception<V>>>,
}

impl<V> Exception<V> {
    pub fn new(
        kind: ExceptionKind,
        err: impl Into<String>,
        description: V,
        arg: Option<V>,
        location: SourceLocation,
    ) -> Self {
        Self {
            kind,
            err: err.into(),
            description,
            arg,
            location,
            call_stack: Vec::new(),
            next: None,
        }
    }

    /// Pushes a frame onto this exception's call stack. Called by callees
    /// as the exception unwinds, so the deepest frame is pushed first.
    pub fn add_stack_info(&mut self, frame: StackFrame) {
        self.call_stack.push(frame);
    }

    /// Chains `cause` as the next (earlier) link, as happens when a catch
    /// block raises a new exception without discarding the one it caught.
    pub fn chain(mut self, cause: Exception<V>) -> Self {
        self.next = Some(Box::new(cause));
        self
    }
}

impl<V: fmt::Display> Exception<V> {
    /// Formats a multi-line human-readable report for this exception and
    /// any chained causes, matching the shape of the runtime's default
    /// exception handler.
    pub fn format_report(&self) -> String {
        let mut out = String::new();
        self.format_into(&mut out);
        out
    }

    fn format_into(&self, out: &mut String) {
        out.push_str(&format!(
            "unhandled exception: {} ({}) at {}\n",
            self.err, self.description, self.location
        ));
        for frame in &self.call_stack {
            let marker = match frame.kind {
                FrameKind::User => "at",
                FrameKind::Builtin => "at (builtin)",
                FrameKind::Rethrow => "rethrown at",
                FrameKind::NewThread => "new thread at",
            };
            let qualified = match &frame.class_name {
                Some(c) => format!("{c}::{}", frame.function),
                None => frame.function.clone(),
            };
            out.push_str(&format!(
                "  {marker} {qualified} ({}:{}-{})\n",
                frame.file.as_deref().unwrap_or("<unknown>"),
                frame.line_range.0,
                frame.line_range.1
            ));
        }
        if let Some(cause) = &self.next {
            out.push_str("chained exception:\n");
            cause.format_into(out);
        }
    }
}

/// Per-thread collector of in-flight Qore-language exceptions.
///
/// An `ExceptionSink` with pending exceptions that is dropped without
/// having been handed off via [`ExceptionSink::assimilate`] invokes the
/// default handler, which logs a human-readable report for each pending
/// exception (and its chained causes) through the `log` facade.
pub struct ExceptionSink<V> {
    exceptions: Vec<Exception<V>>,
    /// Set when a thread-kill (`exit`/`Thread::kill`-style) event is
    /// pending rather than (or alongside) a raised exception.
    event: bool,
    /// Set once the sink's pending exceptions have been moved elsewhere
    /// (assimilated into a parent, or formatted and consumed by a caller),
    /// suppressing the default handler on drop.
    handled: bool,
}

impl<V> Default for ExceptionSink<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ExceptionSink<V> {
    pub fn new() -> Self {
        Self {
            exceptions: Vec::new(),
            event: false,
            handled: false,
        }
    }

    /// Appends a new exception with no location/call-stack context.
    pub fn raise_simple(
        &mut self,
        kind: ExceptionKind,
        err: impl Into<String>,
        description: V,
    ) -> &mut Exception<V> {
        self.raise(kind, err, description, None, SourceLocation::unknown())
    }

    /// Appends a new exception. Never fails: there is no bound on sink
    /// size, so `raise` cannot itself produce an allocation-failure error
    /// path a caller would need to check.
    pub fn raise(
        &mut self,
        kind: ExceptionKind,
        err: impl Into<String>,
        description: V,
        arg: Option<V>,
        location: SourceLocation,
    ) -> &mut Exception<V> {
        self.exceptions
            .push(Exception::new(kind, err, description, arg, location));
        self.exceptions.last_mut().expect("just pushed")
    }

    /// Re-raises `exception` as-is (used by catch blocks and propagation
    /// helpers that already hold a fully formed [`Exception`]).
    pub fn raise_exception(&mut self, exception: Exception<V>) {
        self.exceptions.push(exception);
    }

    /// Marks a thread-kill event as pending. `is_event` becomes true even
    /// if no language exception has been raised.
    pub fn raise_event(&mut self) {
        self.event = true;
    }

    /// True iff at least one exception has been raised.
    pub fn is_exception(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// True iff an exception or a thread-kill event is pending.
    pub fn is_event(&self) -> bool {
        self.event || self.is_exception()
    }

    /// Appends a stack frame to the most recently raised exception, i.e.
    /// the one currently unwinding through the caller.
    pub fn add_stack_info(&mut self, frame: StackFrame) {
        if let Some(last) = self.exceptions.last_mut() {
            last.add_stack_info(frame);
        }
    }

    /// Moves all exceptions (and the event flag) from `other` into `self`,
    /// in order, and marks `other` as handled so its `Drop` is silent.
    pub fn assimilate(&mut self, other: &mut ExceptionSink<V>) {
        self.exceptions.append(&mut other.exceptions);
        self.event = self.event || other.event;
        other.handled = true;
    }

    /// Returns the collected exceptions, leaving the sink empty and marked
    /// handled (the caller now owns formatting/propagation).
    pub fn take_exceptions(&mut self) -> Vec<Exception<V>> {
        self.handled = true;
        std::mem::take(&mut self.exceptions)
    }

    pub fn exceptions(&self) -> &[Exception<V>] {
        &self.exceptions
    }

    /// Clears the sink without running the default handler, e.g. after a
    /// caller has already formatted and logged the exceptions itself.
    pub fn clear(&mut self) {
        self.exceptions.clear();
        self.event = false;
        self.handled = true;
    }
}

impl<V: fmt::Display> ExceptionSink<V> {
    /// Runs the default handler immediately: logs a report for every
    /// pending exception and clears the sink.
    pub fn run_default_handler(&mut self) {
        for exception in &self.exceptions {
            log::error!("{}", exception.format_report());
        }
        self.handled = true;
        self.exceptions.clear();
    }

    /// Like [`ExceptionSink::run_default_handler`] but logs at `warn`
    /// level and does not mark the thread as having been terminated by
    /// the exception (used for advisory/warning exceptions).
    pub fn run_warning_handler(&mut self) {
        for exception in &self.exceptions {
            log::warn!("{}", exception.format_report());
        }
        self.handled = true;
        self.exceptions.clear();
    }
}

impl<V> Drop for ExceptionSink<V> {
    fn drop(&mut self) {
        if self.handled || self.exceptions.is_empty() {
            return;
        }
        // No Display bound is available generically, so the best the
        // generic sink can do is report counts; `qore-value`'s
        // specialization installs a richer handler via `run_default_handler`
        // before drop in all of its own exit paths. This is a last-resort
        // net for callers that genuinely forgot to check `is_exception`.
        log::error!(
            "ExceptionSink dropped with {} unhandled exception(s) (tags: {:?})",
            self.exceptions.len(),
            self.exceptions.iter().map(|e| &e.err).collect::<Vec<_>>()
        );
    }
}

/// Type-erased raise capability.
///
/// Infrastructure below the value model (lock primitives, thread context,
/// deadlock detection, pooled resources) needs to raise Qore-language
/// exceptions without depending on the concrete `Value` type those
/// exceptions describe. Any `ExceptionSink<V>` whose payload can be built
/// from a plain message implements this, so infrastructure code can take
/// `&mut dyn RaiseSink` and the embedding layer passes its real
/// `ExceptionSink<Value>` through unchanged.
pub trait RaiseSink {
    fn raise_tagged(&mut self, kind: ExceptionKind, tag: &str, message: String);
}

impl<V: From<String>> RaiseSink for ExceptionSink<V> {
    fn raise_tagged(&mut self, kind: ExceptionKind, tag: &str, message: String) {
        self.raise_simple(kind, tag, V::from(message));
    }
}

/// Well-known error tags raised by the core itself (as opposed to
/// user-defined `throw` tags, which are arbitrary strings).
pub mod tags {
    pub const LOCK_ERROR: &str = "LOCK-ERROR";
    pub const THREAD_DEADLOCK: &str = "THREAD-DEADLOCK";
    pub const TRANSACTION_TIMEOUT: &str = "TRANSACTION-TIMEOUT";
    pub const DATASOURCEPOOL_TIMEOUT: &str = "DATASOURCEPOOL-TIMEOUT";
    pub const DATASOURCEPOOL_ERROR: &str = "DATASOURCEPOOL-ERROR";
    pub const THREADPOOL_ERROR: &str = "THREADPOOL-ERROR";
    pub const ENCODING_CONVERSION_ERROR: &str = "ENCODING-CONVERSION-ERROR";
    pub const DIVISION_BY_ZERO: &str = "DIVISION-BY-ZERO";
    pub const OUT_OF_MEMORY: &str = "OUT-OF-MEMORY";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_check() {
        let mut sink: ExceptionSink<String> = ExceptionSink::new();
        assert!(!sink.is_exception());
        sink.raise_simple(ExceptionKind::User, "MY-ERROR", "boom".to_string());
        assert!(sink.is_exception());
        assert!(sink.is_event());
        sink.clear();
        assert!(!sink.is_exception());
    }

    #[test]
    fn assimilate_moves_in_order() {
        let mut parent: ExceptionSink<i32> = ExceptionSink::new();
        let mut child: ExceptionSink<i32> = ExceptionSink::new();
        child.raise_simple(ExceptionKind::User, "A", 1);
        child.raise_simple(ExceptionKind::User, "B", 2);
        parent.assimilate(&mut child);
        assert!(!child.is_exception());
        let tags: Vec<_> = parent.exceptions().iter().map(|e| e.err.as_str()).collect();
        assert_eq!(tags, vec!["A", "B"]);
    }

    #[test]
    fn add_stack_info_targets_latest() {
        let mut sink: ExceptionSink<&str> = ExceptionSink::new();
        sink.raise_simple(ExceptionKind::User, "X", "x");
        sink.add_stack_info(StackFrame::new(
            FrameKind::User,
            None,
            "foo",
            Some("a.q".into()),
            1,
            1,
        ));
        assert_eq!(sink.exceptions()[0].call_stack.len(), 1);
    }

    #[test]
    fn chained_report_mentions_both() {
        let inner = Exception::new(
            ExceptionKind::User,
            "X",
            "inner".to_string(),
            None,
            SourceLocation::new("a.q", 1, 1),
        );
        let outer = Exception::new(
            ExceptionKind::User,
            "Y",
            "outer".to_string(),
            None,
            SourceLocation::new("a.q", 2, 2),
        )
        .chain(inner);
        let report = outer.format_report();
        assert!(report.contains("outer"));
        assert!(report.contains("chained exception"));
        assert!(report.contains("inner"));
    }
}

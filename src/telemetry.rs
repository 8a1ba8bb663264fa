//! Structured reporting of protocol violations and broken invariants.
//!
//! Malformed packets, stale acknowledgments and inconsistent rollback state are
//! not errors the caller can act on: they are dropped and logged. Instead of
//! a bare `tracing::warn!`, each one becomes a [`Violation`] handed to a
//! [`ViolationObserver`], so tests can collect and assert on them.
//!
//! ```
//! use rollback_netplay::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use rollback_netplay::report_violation_to;
//! use rollback_netplay::telemetry::ViolationSeverity;
//! use std::sync::Arc;
//!
//! let collector = Arc::new(CollectingObserver::new());
//! let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
//!
//! report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::ControlProtocol,
//!     "declared size {} exceeds received {}", 40, 20);
//! assert!(collector.has_violation(ViolationKind::ControlProtocol));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable: the packet or request was ignored.
    Warning,
    /// Something went wrong that degrades the session (forced resync, lost state).
    Error,
    /// A broken contract. The caller aborts right after reporting.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Malformed, undersized or out-of-role control message.
    ControlProtocol,
    /// A transport send or connect failed.
    Transport,
    /// Input queue invariant violated (gaps, double confirmation).
    InputQueue,
    /// Frame counters disagree (after a load, during resimulation).
    FrameSync,
    /// Save/load of a frame or snapshot failed.
    StateManagement,
    /// Malformed or unexpected rollback-channel message.
    RollbackProtocol,
    /// Local and remote checksums differ.
    Desync,
    /// Reset epoch misuse: stale cookies, duplicate acks, bad rosters.
    Reset,
    /// Frame pacing produced an unusable schedule.
    FramePacing,
    /// Invalid configuration or parameters.
    Configuration,
    /// Internal logic error. These indicate bugs in the library itself.
    InternalError,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ControlProtocol => "control_protocol",
            Self::Transport => "transport",
            Self::InputQueue => "input_queue",
            Self::FrameSync => "frame_sync",
            Self::StateManagement => "state_management",
            Self::RollbackProtocol => "rollback_protocol",
            Self::Desync => "desync",
            Self::Reset => "reset",
            Self::FramePacing => "frame_pacing",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with enough context to diagnose it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The simulation frame at which the violation occurred, if applicable.
    pub frame: Option<Frame>,
    /// Additional key-value context, such as peer ids or cookies.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = frame.to_option();
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Serializes this violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives every violation reported by a session.
///
/// With the `sync-send` feature, observers must be `Send + Sync`.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Keep it cheap; it runs inside the frame loop.
    fn on_violation(&self, violation: &Violation);
}

/// Receives every violation reported by a session.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called when a violation is detected. Keep it cheap; it runs inside the frame loop.
    fn on_violation(&self, violation: &Violation);
}

/// The default observer: logs through `tracing` with structured fields.
///
/// Warnings go to `tracing::warn!`; errors and critical violations go to `tracing::error!`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame = violation.frame.map_or(-1, Frame::as_i32);
        let context = format!("{:?}", violation.context);

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(severity, kind, location, frame, context = %context, "{}", violation.message);
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(severity, kind, location, frame, context = %context, "{}", violation.message);
            },
        }
    }
}

/// Observer that stores violations for later inspection by tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns `true` if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns `true` if a violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns the collected violations of `kind`.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<Violation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports to `observer`, or to a [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &Violation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through `tracing`, tagged with the current file and line.
///
/// ```
/// use rollback_netplay::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::Reset,
///     "stale cookie {} (current {})", 3, 4);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Reports a violation to an `Option<Arc<dyn ViolationObserver>>`, falling back to `tracing`.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Asserts that a [`CollectingObserver`] holds no violations.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a [`CollectingObserver`] holds a violation of the given kind.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn sample() -> Violation {
        Violation::new(
            ViolationSeverity::Warning,
            ViolationKind::Reset,
            "stale cookie",
            "reset.rs:1",
        )
    }

    #[test]
    fn null_frame_is_not_recorded() {
        assert_eq!(sample().with_frame(Frame::NULL).frame, None);
        assert_eq!(
            sample().with_frame(Frame::new(9)).frame,
            Some(Frame::new(9))
        );
    }

    #[test]
    fn display_includes_kind_and_context() {
        let text = sample().with_context("cookie", 3).to_string();
        assert!(text.starts_with("[warning/reset] stale cookie"));
        assert!(text.contains("cookie"));
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample());
        observer.on_violation(&Violation::new(
            ViolationSeverity::Error,
            ViolationKind::Desync,
            "mismatch",
            "x:1",
        ));
        assert_eq!(observer.len(), 2);
        assert_eq!(observer.violations_of_kind(ViolationKind::Desync).len(), 1);
        assert_violation!(observer, ViolationKind::Reset);
        observer.clear();
        assert_no_violations!(observer);
    }

    #[test]
    fn report_violation_to_routes_to_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "send to {} failed",
            7
        );
        let collected = collector.violations();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].message, "send to 7 failed");
        assert!(collected[0].location.contains("telemetry.rs"));

        let none: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &none,
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "goes to tracing"
        );
        assert_eq!(collector.len(), 1);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_snake_case_names() {
        let json = sample().with_frame(Frame::new(4)).to_json().unwrap();
        assert!(json.contains(r#""kind":"reset""#));
        assert!(json.contains(r#""frame":4"#));
    }
}

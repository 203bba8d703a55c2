//! Accumulated policy diagnostics
//!
//! Stages never abort on a policy finding. Each stage returns its output
//! together with the diagnostics it produced ([`Staged`]); the pipeline
//! driver merges them and decides at stage boundaries whether to go on.

use crate::config::CheckLevel;
use serde::Serialize;
use std::fmt;

/// How serious a finding is. Only [`Severity::Error`] counts towards the
/// error count that suppresses emission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[strum(serialize = "Info")]
    Info,
    #[strum(serialize = "Warning")]
    Warning,
    #[strum(serialize = "Error")]
    Error,
}

/// Category of a finding, used to decide which errors are fatal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum DiagKind {
    /// Contradictory topology or NAT bindings
    #[strum(serialize = "topology")]
    Topology,
    /// Invalid NAT definitions
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "subnet")]
    Subnet,
    #[strum(serialize = "reroute")]
    Reroute,
    #[strum(serialize = "owner")]
    Owner,
    #[strum(serialize = "group")]
    Group,
    #[strum(serialize = "path")]
    Path,
    #[strum(serialize = "unstable-nat")]
    UnstableNat,
    #[strum(serialize = "dynamic-nat")]
    DynamicNat,
    #[strum(serialize = "unused")]
    Unused,
    #[strum(serialize = "redundancy")]
    Redundancy,
    #[strum(serialize = "distribution")]
    Distribution,
}

impl DiagKind {
    /// Errors of these kinds leave the model in a state later stages must not see.
    pub const fn is_fatal(self) -> bool {
        matches!(self, DiagKind::Topology | DiagKind::Nat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagKind,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, kind: DiagKind, message: impl Into<String>) {
        self.items.push(Diagnostic {
            severity,
            kind,
            message: message.into(),
        });
    }

    pub fn error(&mut self, kind: DiagKind, message: impl Into<String>) {
        self.push(Severity::Error, kind, message);
    }

    pub fn warning(&mut self, kind: DiagKind, message: impl Into<String>) {
        self.push(Severity::Warning, kind, message);
    }

    pub fn info(&mut self, kind: DiagKind, message: impl Into<String>) {
        self.push(Severity::Info, kind, message);
    }

    /// Reports a finding whose severity is chosen by configuration.
    pub fn report(&mut self, level: CheckLevel, kind: DiagKind, message: impl Into<String>) {
        match level {
            CheckLevel::No => {}
            CheckLevel::Warn => self.warning(kind, message),
            CheckLevel::Err => self.error(kind, message),
        }
    }

    pub fn error_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.items
            .iter()
            .any(|d| d.severity == Severity::Error && d.kind.is_fatal())
    }

    pub fn merge(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    /// Takes the diagnostics of a stage result and returns its value.
    pub fn absorb<T>(&mut self, staged: Staged<T>) -> T {
        self.merge(staged.diagnostics);
        staged.value
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Messages of one kind, handy for assertions.
    pub fn messages(&self, kind: DiagKind) -> Vec<&str> {
        self.items
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| d.message.as_str())
            .collect()
    }

    /// Sorts findings by severity (errors last) while keeping emission order
    /// within one severity.
    pub fn sort_for_display(&mut self) {
        self.items.sort_by_key(|d| d.severity);
    }
}

impl FromIterator<Diagnostics> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostics>>(iter: I) -> Self {
        let mut all = Diagnostics::new();
        for diag in iter {
            all.merge(diag);
        }
        all
    }
}

/// Output of one pipeline stage plus what it found along the way.
#[derive(Debug, Clone)]
pub struct Staged<T> {
    pub value: T,
    pub diagnostics: Diagnostics,
}

impl<T> Staged<T> {
    pub fn new(value: T, diagnostics: Diagnostics) -> Self {
        Self { value, diagnostics }
    }

    pub fn clean(value: T) -> Self {
        Self::new(value, Diagnostics::new())
    }
}

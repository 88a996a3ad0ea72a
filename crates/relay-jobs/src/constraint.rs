//! Named preconditions that gate job eligibility.
//!
//! A constraint that is not met is not a failure: the job just waits. The
//! engine re-checks constraints when one reports a change and on every
//! periodic sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;

/// A re-evaluatable predicate shared by many jobs.
pub trait Constraint: Send + Sync {
    /// Current state of the predicate.
    fn is_met(&self) -> bool;

    /// Hook called once at engine start. Constraints that can detect their own
    /// unmet → met flip should keep the notifier and call it.
    fn observe(&self, _notifier: ConstraintNotifier) {}
}

/// Handle a constraint uses to wake the scheduler.
#[derive(Debug, Clone)]
pub struct ConstraintNotifier {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Arc<str>>,
}

impl ConstraintNotifier {
    pub(crate) fn new(name: Arc<str>, tx: mpsc::UnboundedSender<Arc<str>>) -> Self {
        Self { name, tx }
    }

    /// Name of the constraint this notifier belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tell the scheduler the constraint changed. Returns `false` once the
    /// engine has stopped.
    pub fn notify(&self) -> bool {
        self.tx.send(self.name.clone()).is_ok()
    }

    /// Whether the engine this notifier belongs to has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A constraint backed by a flag that an outside integration flips, e.g. a
/// connectivity listener driving `NetworkAvailable`.
#[derive(Debug, Default)]
pub struct FlagConstraint {
    met: AtomicBool,
    notifiers: Mutex<Vec<ConstraintNotifier>>,
}

impl FlagConstraint {
    pub fn new(initially_met: bool) -> Arc<Self> {
        Arc::new(Self {
            met: AtomicBool::new(initially_met),
            notifiers: Mutex::new(Vec::new()),
        })
    }

    /// Update the flag; wakes the scheduler on an unmet → met transition.
    pub fn set(&self, met: bool) {
        let was_met = self.met.swap(met, Ordering::SeqCst);
        if met && !was_met {
            let mut notifiers = match self.notifiers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Engines that stopped drop out.
            notifiers.retain(ConstraintNotifier::notify);
        }
    }
}

impl Constraint for FlagConstraint {
    fn is_met(&self) -> bool {
        self.met.load(Ordering::SeqCst)
    }

    fn observe(&self, notifier: ConstraintNotifier) {
        let mut notifiers = match self.notifiers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        notifiers.retain(|n| !n.is_closed());
        notifiers.push(notifier);
    }
}

/// The set of constraints known to an engine, by name.
#[derive(Default, Clone)]
pub struct ConstraintRegistry {
    constraints: FxHashMap<Arc<str>, Arc<dyn Constraint>>,
    warned_unknown: FxHashSet<String>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named constraint.
    pub fn register(&mut self, name: impl Into<String>, constraint: Arc<dyn Constraint>) {
        let name: Arc<str> = Arc::from(name.into());
        self.constraints.insert(name, constraint);
    }

    /// Hand every constraint a notifier wired to `tx`.
    pub(crate) fn attach(&self, tx: &mpsc::UnboundedSender<Arc<str>>) {
        for (name, constraint) in &self.constraints {
            constraint.observe(ConstraintNotifier::new(name.clone(), tx.clone()));
        }
    }

    /// Whether the named constraint is registered and met.
    pub fn is_met(&mut self, name: &str) -> bool {
        match self.constraints.get(name) {
            Some(constraint) => constraint.is_met(),
            None => {
                if self.warned_unknown.insert(name.to_string()) {
                    tracing::warn!(constraint = %name, "Job requires an unregistered constraint; treating it as unmet");
                }
                false
            }
        }
    }

    /// Whether every named constraint is met.
    pub fn all_met(&mut self, names: &[String]) -> bool {
        names.iter().all(|name| self.is_met(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constraints.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

impl std::fmt::Debug for ConstraintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.constraints.keys().collect();
        names.sort();
        f.debug_struct("ConstraintRegistry")
            .field("constraints", &names)
            .finish()
    }
}

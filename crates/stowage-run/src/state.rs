//! Run state machine
//!
//! A run's state is not stored as an enum. It is a flag set derived on every
//! reconcile from the condition list, the spec and the annotations, plus one
//! piece of process memory: the [`LivenessSet`] of runs this process has put
//! in progress. A run that reports InProgress but is unknown to the set was
//! started by a previous process and can never finish, so it is flagged
//! interrupted.

use dashmap::DashSet;

use stowage_common::annotations;
use stowage_common::crd::{
    add_condition_if_missing, set_condition, BackupRun, BackupRunStatus, Condition,
    ConditionStatus, RunCondition,
};
use stowage_common::kube_utils::annotation;

/// Runs this process believes are executing, keyed by uid
#[derive(Debug, Default)]
pub struct LivenessSet {
    uids: DashSet<String>,
}

impl LivenessSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the set with the observed InProgress condition of a run.
    ///
    /// Returns true when the run is in progress but was not started by this
    /// process. The uid is recorded so the interruption is reported once.
    pub fn observe(&self, uid: &str, in_progress: bool) -> bool {
        if in_progress {
            self.uids.insert(uid.to_string())
        } else {
            self.uids.remove(uid);
            false
        }
    }

    /// Record a run this process is about to execute
    pub fn insert(&self, uid: &str) {
        self.uids.insert(uid.to_string());
    }

    /// True when the run is known to be executing in this process
    pub fn contains(&self, uid: &str) -> bool {
        self.uids.contains(uid)
    }

    /// Number of tracked runs
    pub fn len(&self) -> usize {
        self.uids.len()
    }

    /// True when no run is tracked
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}

/// Flags derived from a BackupRun
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunState {
    /// InProgress without this process having started it
    pub interrupted: bool,
    /// InProgress condition
    pub in_progress: bool,
    /// Successful condition
    pub successful: bool,
    /// Failed condition
    pub failed: bool,
    /// Ready condition
    pub ready: bool,
    /// Finished, successfully or not
    pub completed: bool,
    /// None of InProgress, Successful or Failed
    pub never_run: bool,
    /// Restore configured without a backup action
    pub restore_only: bool,
    /// A backup is due
    pub have_to_backup: bool,
    /// A restore is due
    pub have_to_restore: bool,
    /// Encryption configured
    pub encrypted: bool,
    /// Compression configured
    pub compressed: bool,
    /// Restore can run unattended
    pub restorable: bool,
}

impl RunState {
    /// Derive flags from the run and update the liveness set
    pub fn analyze(run: &BackupRun, liveness: &LivenessSet) -> Self {
        let in_progress = run.condition_is_true(RunCondition::InProgress);
        let uid = run.metadata.uid.as_deref().unwrap_or_default();
        let interrupted = liveness.observe(uid, in_progress);
        Self::derive(run, interrupted)
    }

    /// Derive flags from the run alone
    pub fn derive(run: &BackupRun, interrupted: bool) -> Self {
        let spec = &run.spec;
        let in_progress = run.condition_is_true(RunCondition::InProgress);
        let successful = run.condition_is_true(RunCondition::Successful);
        let failed = run.condition_is_true(RunCondition::Failed);
        let restore_requested = annotation(run, annotations::RESTORE).is_some();

        let completed = !in_progress && (successful || failed);
        let never_run = !(in_progress || successful || failed);
        let restore_only = spec.is_restore_only();
        let encrypted = spec.encryption.is_some();

        Self {
            interrupted,
            in_progress,
            successful,
            failed,
            ready: run.condition_is_true(RunCondition::Ready),
            completed,
            never_run,
            restore_only,
            have_to_backup: !completed && spec.backup.is_some() && never_run,
            have_to_restore: (restore_only && (!completed || restore_requested))
                || (spec.restore.is_some() && completed && restore_requested),
            encrypted,
            compressed: spec.compression.is_some(),
            restorable: spec.restore.is_some()
                && (!encrypted
                    || spec
                        .encryption
                        .as_ref()
                        .is_some_and(|e| e.decryption_key.is_some())),
        }
    }

    /// Move into `phase`, updating the lifecycle flags the way the written
    /// conditions will read
    pub fn enter(&mut self, phase: Phase) -> Transition {
        let t = Transition::plan(self, phase);
        self.ready = t.ready;
        self.never_run = t.never_run;
        self.in_progress = t.in_progress;
        self.failed = t.failed;
        self.successful = t.successful;
        t
    }

    /// Conditions written when a run is first observed
    pub fn initial_conditions(&self, generation: Option<i64>) -> Vec<Condition> {
        [
            (RunCondition::Ready, self.ready),
            (RunCondition::NeverRun, self.never_run),
            (RunCondition::InProgress, self.in_progress),
            (RunCondition::Failed, self.failed),
            (RunCondition::Successful, self.successful),
            (RunCondition::Restorable, self.restorable),
            (RunCondition::Encrypted, self.encrypted),
            (RunCondition::Compressed, self.compressed),
        ]
        .into_iter()
        .map(|(condition, value)| {
            Condition::new(
                condition.as_str(),
                ConditionStatus::from(value),
                "Initializing",
                "Initializing",
            )
            .observed(generation)
        })
        .collect()
    }
}

/// Add any missing condition without touching existing ones
pub fn initialize_conditions(status: &mut BackupRunStatus, state: &RunState, generation: Option<i64>) {
    for condition in state.initial_conditions(generation) {
        add_condition_if_missing(&mut status.conditions, condition);
    }
}

/// Condition a run is moved into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Execution started
    InProgress,
    /// Execution failed or never got started
    Failed,
    /// Execution finished
    Successful,
}

impl Phase {
    fn condition(self) -> RunCondition {
        match self {
            Self::InProgress => RunCondition::InProgress,
            Self::Failed => RunCondition::Failed,
            Self::Successful => RunCondition::Successful,
        }
    }
}

/// Condition values, reason and state label for a phase change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Ready condition
    pub ready: bool,
    /// NeverRun condition
    pub never_run: bool,
    /// InProgress condition
    pub in_progress: bool,
    /// Failed condition
    pub failed: bool,
    /// Successful condition
    pub successful: bool,
    /// Reason shared by the rewritten conditions
    pub reason: &'static str,
    /// Message shared by the rewritten conditions
    pub message: String,
    /// Value for `status.state`
    pub state: &'static str,
}

impl Transition {
    /// Plan the move of a run in `state` into `phase`
    pub fn plan(state: &RunState, phase: Phase) -> Self {
        let mut t = Self {
            ready: false,
            never_run: false,
            in_progress: false,
            failed: false,
            successful: false,
            reason: "Unknown",
            message: phase.condition().to_string(),
            state: "Unknown",
        };
        let mut describe = |reason: &'static str, message: &str, label: &'static str| {
            t.reason = reason;
            t.message = message.to_string();
            t.state = label;
        };

        match phase {
            Phase::InProgress => {
                if state.have_to_backup {
                    describe("Backuping", "Making a backup", "Backuping");
                } else if state.have_to_restore {
                    describe("Restoring", "Restoring the backup", "Restoring");
                }
                t.in_progress = true;
            }
            Phase::Failed => {
                if state.never_run {
                    // nothing was attempted, keep the run eligible for a retry
                    describe("Error", "Storage or access error", "StorageError");
                    t.never_run = true;
                } else {
                    if state.interrupted {
                        describe(
                            "Interrupted",
                            "Run has been interrupted and considered as failed",
                            "InterruptedFailed",
                        );
                    } else if state.have_to_backup {
                        describe("BackupFailed", "Backup failed", "BackupFailed");
                    } else if state.have_to_restore {
                        describe("RestoreFailed", "Restore failed", "RestoreFailed");
                    }
                    t.failed = true;
                }
            }
            Phase::Successful => {
                if state.have_to_backup {
                    describe("BackupSuccessful", "Backup successful", "BackupSuccessful");
                } else if state.have_to_restore {
                    describe("RestoreSuccessful", "Restore successful", "RestoreSuccessful");
                }
                t.successful = true;
                t.ready = true;
            }
        }
        t
    }

    /// Rewrite the five lifecycle conditions and the state label
    pub fn apply(&self, status: &mut BackupRunStatus, generation: Option<i64>) {
        for (condition, value) in [
            (RunCondition::Ready, self.ready),
            (RunCondition::NeverRun, self.never_run),
            (RunCondition::InProgress, self.in_progress),
            (RunCondition::Failed, self.failed),
            (RunCondition::Successful, self.successful),
        ] {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    condition.as_str(),
                    ConditionStatus::from(value),
                    self.reason,
                    self.message.clone(),
                )
                .observed(generation),
            );
        }
        status.state = Some(self.state.to_string());
    }
}

//! Label vocabulary for the workflow state machine.
//!
//! Labels are the durable state: running labels indicate an in-progress
//! stage, ready labels a completed one, failed labels a stage that needs
//! operator attention. Control labels (`yolo`, `reset`) are applied by
//! humans and consumed by the reconciler.

/// Workflow running labels (in-progress state).
pub const PREPARING: &str = "preparing";
pub const RESEARCHING: &str = "researching";
pub const PLANNING: &str = "planning";
pub const IMPLEMENTING: &str = "implementing";
pub const EDITING: &str = "editing";

/// Workflow completion labels.
pub const RESEARCH_READY: &str = "research_ready";
pub const PLAN_READY: &str = "plan_ready";

/// Failure labels. Cleared only by `reset`.
pub const RESEARCH_FAILED: &str = "research_failed";
pub const PLAN_FAILED: &str = "plan_failed";
pub const IMPLEMENTATION_FAILED: &str = "implementation_failed";
pub const YOLO_FAILED: &str = "yolo_failed";

/// Lifecycle labels.
pub const REVIEWING: &str = "reviewing";
pub const CLEANED_UP: &str = "cleaned_up";

/// Control labels, applied by humans.
pub const YOLO: &str = "yolo";
pub const RESET: &str = "reset";

/// Metadata for bootstrapping labels in watched repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub color: &'static str,
}

/// Labels the daemon creates in each watched repository at startup.
pub const REQUIRED_LABELS: &[LabelSpec] = &[
    LabelSpec {
        name: PREPARING,
        description: "Prepare workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        name: RESEARCHING,
        description: "Research workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        name: RESEARCH_READY,
        description: "Research complete",
        color: "2ECC71",
    },
    LabelSpec {
        name: RESEARCH_FAILED,
        description: "Research workflow failed",
        color: "DC2626",
    },
    LabelSpec {
        name: PLANNING,
        description: "Plan workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        name: PLAN_READY,
        description: "Plan complete",
        color: "2ECC71",
    },
    LabelSpec {
        name: PLAN_FAILED,
        description: "Plan workflow failed",
        color: "DC2626",
    },
    LabelSpec {
        name: IMPLEMENTING,
        description: "Implement workflow in progress",
        color: "FFA500",
    },
    LabelSpec {
        name: IMPLEMENTATION_FAILED,
        description: "Implementation workflow failed after retries",
        color: "DC2626",
    },
    LabelSpec {
        name: REVIEWING,
        description: "PR under review",
        color: "1D76DB",
    },
    LabelSpec {
        name: EDITING,
        description: "Processing user comment",
        color: "1D76DB",
    },
    LabelSpec {
        name: CLEANED_UP,
        description: "Worktree has been cleaned up",
        color: "BFDADC",
    },
    LabelSpec {
        name: YOLO,
        description: "Auto-progress through Research → Plan → Implement",
        color: "A855F7",
    },
    LabelSpec {
        name: YOLO_FAILED,
        description: "Auto-progression failed",
        color: "DC2626",
    },
    LabelSpec {
        name: RESET,
        description: "Clear kiln content and move issue to Backlog",
        color: "3B82F6",
    },
];

/// Labels that indicate a stage is currently executing. At most one of
/// these may be present on an issue at any observable moment.
pub const RUNNING_LABELS: &[&str] = &[PREPARING, RESEARCHING, PLANNING, IMPLEMENTING, EDITING];

/// Every label the daemon manages. `reset` strips all of these.
pub const KILN_LABELS: &[&str] = &[
    PREPARING,
    RESEARCHING,
    PLANNING,
    IMPLEMENTING,
    EDITING,
    RESEARCH_READY,
    PLAN_READY,
    RESEARCH_FAILED,
    PLAN_FAILED,
    IMPLEMENTATION_FAILED,
    YOLO_FAILED,
    REVIEWING,
    CLEANED_UP,
    YOLO,
];

pub fn is_running_label(name: &str) -> bool {
    RUNNING_LABELS.contains(&name)
}

/// True for labels owned by the daemon. The `reset` control label itself is
/// excluded: it is removed separately once the reset completes.
pub fn is_kiln_label(name: &str) -> bool {
    KILN_LABELS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_labels_are_kiln_labels() {
        for label in RUNNING_LABELS {
            assert!(is_kiln_label(label), "{label} missing from KILN_LABELS");
        }
    }

    #[test]
    fn reset_is_not_stripped_as_kiln_label() {
        assert!(!is_kiln_label(RESET));
    }

    #[test]
    fn required_labels_cover_the_state_machine() {
        let names: Vec<&str> = REQUIRED_LABELS.iter().map(|l| l.name).collect();
        for label in KILN_LABELS {
            assert!(names.contains(label), "{label} has no bootstrap spec");
        }
        assert!(names.contains(&RESET));
    }
}

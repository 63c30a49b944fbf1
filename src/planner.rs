//! Builds the per-iteration planning prompt and parses the Agent's decision
//! about whether (and where) this turn needs to write files.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::models::ProjectEntry;

/// Parsed form of the fenced ```planning block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    NoWrite,
    /// Reuse the existing worktree (or NoWrite if none exists yet).
    Current,
    /// 1-based project numbers from the numbered prompt list.
    Targets(Vec<usize>),
    /// Heuristic / fail-safe fallback: write needed against `root_folder`,
    /// used when the fenced block is absent or parsing raised an error.
    RootFolder,
}

const PLANNING_VERBS: &[&str] = &[
    "create", "edit", "modify", "update", "write", "add", "delete", "change", "implement",
];

static PLANNING_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```planning\s*\n?(.*?)```").unwrap()
});
static NEEDS_WRITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)NEEDS_WRITE:\s*(YES|NO)").unwrap()
});
static WRITE_TARGETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)WRITE_TARGETS:\s*([A-Za-z0-9,\s]+)").unwrap()
});

/// Builds the planning prompt: numbered project list + instructions + the
/// exact fenced-block protocol the Agent must reply with.
pub fn build_prompt(description: &str, projects: &[ProjectEntry], root_folder: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("Before making any changes, plan which projects this turn needs to touch.\n\n");
    out.push_str("Task: ");
    out.push_str(description);
    out.push_str("\n\nProjects:\n");

    if projects.is_empty() {
        let root = root_folder.unwrap_or(".");
        out.push_str(&format!("1. {root} (root folder)\n"));
    } else {
        for (i, p) in projects.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} — {} (access: {:?}, type: {:?})\n",
                i + 1,
                p.path,
                p.context,
                p.access,
                p.project_type
            ));
        }
    }

    out.push_str(
        "\nDo not make any file changes in this turn. Reply with whether code changes are \
         required and, if so, which project numbers, using exactly this fenced block:\n\n\
         ```planning\n\
         NEEDS_WRITE: YES|NO\n\
         WRITE_TARGETS: <comma-separated numbers> | NONE | CURRENT\n\
         ```\n",
    );
    out
}

/// Parses the Agent's planning response into a decision. Falls back to the
/// verb heuristic when the fenced block is absent, and to `RootFolder` on
/// any other unparseable shape — fail-safe toward isolation, per design.
pub fn parse(response: &str) -> PlanDecision {
    let Some(caps) = PLANNING_BLOCK.captures(response) else {
        return heuristic(response);
    };
    let block = &caps[1];

    let needs_write = NEEDS_WRITE
        .captures(block)
        .map(|c| c[1].eq_ignore_ascii_case("YES"))
        .unwrap_or(false);

    if !needs_write {
        return PlanDecision::NoWrite;
    }

    let Some(targets_caps) = WRITE_TARGETS.captures(block) else {
        return PlanDecision::RootFolder;
    };
    let raw = targets_caps[1].trim();

    if raw.eq_ignore_ascii_case("NONE") {
        return PlanDecision::NoWrite;
    }
    if raw.eq_ignore_ascii_case("CURRENT") {
        return PlanDecision::Current;
    }

    let numbers: Vec<usize> = raw
        .split(',')
        .filter_map(|tok| tok.trim().parse::<usize>().ok())
        .collect();

    if numbers.is_empty() {
        PlanDecision::RootFolder
    } else {
        PlanDecision::Targets(numbers)
    }
}

fn heuristic(response: &str) -> PlanDecision {
    let lower = response.to_lowercase();
    if PLANNING_VERBS.iter().any(|v| lower.contains(v)) {
        PlanDecision::RootFolder
    } else {
        PlanDecision::NoWrite
    }
}

/// Resolves target project numbers to concrete project paths. Unknown
/// numbers are skipped with a warning, never making the caller panic.
pub fn resolve_targets<'a>(numbers: &[usize], projects: &'a [ProjectEntry]) -> Vec<&'a ProjectEntry> {
    numbers
        .iter()
        .filter_map(|&n| {
            if n == 0 || n > projects.len() {
                tracing::warn!("planning response referenced unknown project number {n}");
                None
            } else {
                Some(&projects[n - 1])
            }
        })
        .collect()
}

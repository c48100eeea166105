//! Worker prompt rendering
//!
//! Pure function from session facts to the bootstrap prompt written into
//! the worktree. Caller-supplied sections are appended verbatim.

use crate::session::{IssueRef, SessionMode};
use std::path::Path;

/// Inputs to one prompt render.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub owner: &'a str,
    pub repo: &'a str,
    pub issue: &'a IssueRef,
    pub branch_name: &'a str,
    pub worktree_path: &'a Path,
    pub mode: SessionMode,
    pub additional_sections: &'a [String],
}

const TEMPLATE: &str = "\
# Task

You are working on {owner}/{repo} issue #{issue_number}: {issue_title}

Your working copy is an isolated git worktree at {worktree_path}, on branch
{branch_name}. Work only inside this directory. Commit as you go.

The issue body has been copied to IMPLEMENTATION_PLAN.md at the worktree
root. Maintain it as a markdown task list (`- [ ]` / `- [x]`), checking
tasks off as you complete them.

# Session protocol

- Your session identity and control commands are in
  .claude/session-context.json. Invoke the heartbeat command there
  periodically so the orchestrator knows you are alive.
- .claude/session-state.json is written by the orchestrator. If its status
  becomes `cancelled`, stop what you are doing and exit cleanly.
- If a forwarded message appears there, treat it as operator guidance.
- Before exiting, write a single line to .claude/.worker-status:
  `task_done` if you finished one task and more remain, `complete` if the
  whole plan is done.
- If review feedback exists at .claude/review-feedback.md, address it
  before anything else.
- If you cannot make progress, write a short explanation to a `.stuck`
  file at the worktree root and exit.

# Mode

{mode_section}
";

const MANUAL_MODE: &str = "\
This session is operator-driven. Complete the issue, then stop and wait
for instructions.";

const AUTONOMOUS_MODE: &str = "\
This session runs under a bounded improvement loop. You will be respawned
until the plan is complete or the iteration budget runs out; leave the
worktree in a state your next incarnation can pick up.";

/// Render the worker's bootstrap prompt.
pub fn render(inputs: &PromptInputs<'_>) -> String {
    let mode_section = match inputs.mode {
        SessionMode::Manual => MANUAL_MODE,
        SessionMode::Autonomous => AUTONOMOUS_MODE,
    };

    let mut body = TEMPLATE
        .replace("{owner}", inputs.owner)
        .replace("{repo}", inputs.repo)
        .replace("{issue_number}", &inputs.issue.number.to_string())
        .replace("{issue_title}", &inputs.issue.title)
        .replace("{branch_name}", inputs.branch_name)
        .replace("{worktree_path}", &inputs.worktree_path.display().to_string())
        .replace("{mode_section}", mode_section);

    for section in inputs.additional_sections {
        body.push('\n');
        body.push_str(section);
        if !section.ends_with('\n') {
            body.push('\n');
        }
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn inputs<'a>(issue: &'a IssueRef, path: &'a Path, sections: &'a [String]) -> PromptInputs<'a> {
        PromptInputs {
            owner: "acme",
            repo: "widgets",
            issue,
            branch_name: "issue-42",
            worktree_path: path,
            mode: SessionMode::Manual,
            additional_sections: sections,
        }
    }

    #[test]
    fn substitutes_all_placeholders() {
        let issue = IssueRef {
            number: 42,
            title: "Add X".to_string(),
            body: String::new(),
        };
        let path = PathBuf::from("/work/widgets-issue-42");
        let body = render(&inputs(&issue, &path, &[]));

        assert!(body.contains("acme/widgets issue #42: Add X"));
        assert!(body.contains("branch\nissue-42"));
        assert!(body.contains("/work/widgets-issue-42"));
        assert!(!body.contains('{'), "unsubstituted placeholder in:\n{}", body);
    }

    #[test]
    fn appends_additional_sections_in_order() {
        let issue = IssueRef {
            number: 1,
            title: "t".to_string(),
            body: String::new(),
        };
        let path = PathBuf::from("/w");
        let sections = vec!["# Extra A\nfirst".to_string(), "# Extra B\nsecond".to_string()];
        let body = render(&inputs(&issue, &path, &sections));

        let a = body.find("# Extra A").unwrap();
        let b = body.find("# Extra B").unwrap();
        assert!(a < b);
        assert!(body.ends_with("second\n"));
    }

    #[test]
    fn mode_changes_trailing_section() {
        let issue = IssueRef {
            number: 1,
            title: "t".to_string(),
            body: String::new(),
        };
        let path = PathBuf::from("/w");
        let mut manual = inputs(&issue, &path, &[]);
        manual.mode = SessionMode::Manual;
        assert!(render(&manual).contains("operator-driven"));

        let mut auto = inputs(&issue, &path, &[]);
        auto.mode = SessionMode::Autonomous;
        assert!(render(&auto).contains("bounded improvement loop"));
    }
}

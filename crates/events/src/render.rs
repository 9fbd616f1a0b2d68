use std::fmt::Write;

use terrapin_core::{models::DEFAULT_WORKSPACE, util::truncate_start};

use crate::{
    command::{Command, CommandName},
    result::{CommandResult, PlanSuccess, ProjectOutcome, ProjectResult},
};

/// GitHub rejects comments over 65536 characters; leave room for the markup.
const MAX_OUTPUT_LEN: usize = 60_000;

pub const HELP_COMMENT: &str = "\
Comment one of the commands below to run terraform for this pull request.

**Commands**
* `terrapin plan` runs plan in every directory with modified terraform files
* `terrapin apply` applies the plans made on this pull request
* `terrapin help` shows this message

**Options**
* `-d dir` runs in `dir` only, relative to the repository root
* `-w workspace` or a bare word selects the terraform workspace, `default` if unset
* `--verbose` appends the hook and init output
* `-- flags` passes everything after `--` to terraform

Plans lock their directory and workspace until they are applied or the pull request is closed.";

/// Renders the comment posted when a command completes.
pub fn render_command_result(command: &Command, result: &CommandResult) -> String {
    let name = command.name;
    if let Some(error) = &result.error {
        return format!("**{name} Error**\n```\n{error:#}\n```");
    }
    if let Some(failure) = &result.failure {
        return format!("**{name} Failed**: {failure}");
    }
    let count = result.project_results.len();
    let max_len = MAX_OUTPUT_LEN / count.max(1);
    if count == 1 {
        return render_project(command, &result.project_results[0], max_len);
    }

    let mut out = format!("Ran {name} for {count} projects:\n");
    for project_result in &result.project_results {
        let _ = writeln!(out, "1. {}", project_heading(project_result));
    }
    for (idx, project_result) in result.project_results.iter().enumerate() {
        let _ = write!(
            out,
            "\n### {}. {}\n{}\n\n---",
            idx + 1,
            project_heading(project_result),
            render_project(command, project_result, max_len)
        );
    }
    out
}

fn project_heading(result: &ProjectResult) -> String {
    format!("dir: `{}` workspace: `{}`", result.project.path, result.workspace)
}

fn render_project(command: &Command, result: &ProjectResult, max_len: usize) -> String {
    let name = command.name;
    let mut out = match &result.outcome {
        ProjectOutcome::PlanSuccess(success) => render_plan(result, success, max_len),
        ProjectOutcome::ApplySuccess(output) => {
            format!("```diff\n{}\n```", truncate_start(output.trim(), max_len))
        }
        ProjectOutcome::Failure(message) => format!("**{name} Failed**: {message}"),
        ProjectOutcome::Error(error) => {
            let error = truncate_start(&format!("{error:#}"), max_len);
            format!("**{name} Error**\n```\n{error}\n```")
        }
    };
    if command.verbose && !result.log.is_empty() {
        let _ = write!(
            out,
            "\n\n<details><summary>Log</summary>\n\n```\n{}\n```\n</details>",
            truncate_start(result.log.trim(), max_len)
        );
    }
    out
}

fn render_plan(result: &ProjectResult, success: &PlanSuccess, max_len: usize) -> String {
    let mut apply = format!("terrapin apply -d {}", result.project.path);
    if result.workspace != DEFAULT_WORKSPACE {
        let _ = write!(apply, " -w {}", result.workspace);
    }
    let summary = if success.changes_present { "" } else { "No changes. " };
    format!(
        "```diff\n{}\n```\n\n{summary}* To **apply** this plan, comment `{apply}`\n\
         * To **discard** this plan, delete the [lock]({})",
        truncate_start(success.terraform_output.trim(), max_len),
        success.lock_url,
    )
}

/// Posted when the same command is already running for the pull request.
pub fn render_already_running(name: CommandName, workspace: &str) -> String {
    format!(
        "**{name} Failed**: A command is already running in workspace `{workspace}` for this \
         pull request. Wait until it completes and try again."
    )
}

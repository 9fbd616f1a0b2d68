use terrapin_core::{models::Project, vcs::CommitStatus};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlanSuccess {
    pub terraform_output: String,
    pub changes_present: bool,
    /// Link to the page for the lock retained by this plan.
    pub lock_url: String,
}

#[derive(Debug)]
pub enum ProjectOutcome {
    PlanSuccess(PlanSuccess),
    ApplySuccess(String),
    /// Expected, user-facing failure: lock conflict, missing approval, etc.
    Failure(String),
    /// Tool or infrastructure error.
    Error(anyhow::Error),
}

#[derive(Debug)]
pub struct ProjectResult {
    pub project: Project,
    pub workspace: String,
    pub outcome: ProjectOutcome,
    /// Output of hooks and `terraform init`, shown for verbose commands.
    pub log: String,
}

impl ProjectResult {
    pub fn new(project: &Project, workspace: &str, outcome: ProjectOutcome) -> Self {
        Self {
            project: project.clone(),
            workspace: workspace.to_string(),
            outcome,
            log: String::new(),
        }
    }

    pub fn failure(project: &Project, workspace: &str, message: impl Into<String>) -> Self {
        Self::new(project, workspace, ProjectOutcome::Failure(message.into()))
    }

    pub fn error(project: &Project, workspace: &str, error: anyhow::Error) -> Self {
        Self::new(project, workspace, ProjectOutcome::Error(error))
    }

    pub fn with_log(mut self, log: String) -> Self {
        self.log = log;
        self
    }

    pub fn status(&self) -> CommitStatus {
        match self.outcome {
            ProjectOutcome::PlanSuccess(_) | ProjectOutcome::ApplySuccess(_) => {
                CommitStatus::Success
            }
            ProjectOutcome::Failure(_) | ProjectOutcome::Error(_) => CommitStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool { self.status() == CommitStatus::Success }
}

/// Outcome of a whole command. Either the command failed before any project
/// ran, or it holds one result per attempted project.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub project_results: Vec<ProjectResult>,
    pub failure: Option<String>,
    pub error: Option<anyhow::Error>,
}

impl CommandResult {
    pub fn from_projects(project_results: Vec<ProjectResult>) -> Self {
        Self { project_results, ..Default::default() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { failure: Some(message.into()), ..Default::default() }
    }

    pub fn error(error: anyhow::Error) -> Self { Self { error: Some(error), ..Default::default() } }

    /// Success only when nothing failed and every project succeeded.
    pub fn status(&self) -> CommitStatus {
        if self.failure.is_some()
            || self.error.is_some()
            || self.project_results.iter().any(|r| !r.is_success())
        {
            CommitStatus::Failed
        } else {
            CommitStatus::Success
        }
    }
}

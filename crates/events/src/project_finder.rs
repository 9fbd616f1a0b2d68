use std::path::Path;

use terrapin_core::models::Project;

/// Maps modified files to the projects they belong to.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectFinder;

impl ProjectFinder {
    /// Projects are the directories holding modified terraform files, or the
    /// parent of an `env/` directory holding per-workspace variables. Order
    /// follows the first file seen for each project.
    pub fn find_modified_projects(
        &self,
        repo_full_name: &str,
        modified_files: &[String],
    ) -> Vec<Project> {
        let mut projects: Vec<Project> = vec![];
        for file in modified_files.iter().filter(|f| is_terraform_file(f)) {
            let project = Project::new(repo_full_name, &project_dir(file));
            if !projects.contains(&project) {
                projects.push(project);
            }
        }
        projects
    }
}

fn is_terraform_file(file: &str) -> bool {
    let name = file.rsplit('/').next().unwrap_or(file);
    name.contains(".tf") && !name.contains("terraform.tfstate")
}

fn project_dir(file: &str) -> String {
    let dir = Path::new(file).parent().unwrap_or(Path::new(""));
    let dir = match dir.file_name() {
        Some(name) if name == "env" => dir.parent().unwrap_or(Path::new("")),
        _ => dir,
    };
    dir.to_string_lossy().into_owned()
}

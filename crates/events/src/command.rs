use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use terrapin_core::models::{DEFAULT_WORKSPACE, clean_path};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    Plan,
    Apply,
    Help,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Help => "help",
        }
    }
}

impl FromStr for CommandName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            "help" => Ok(Self::Help),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plan => "Plan",
            Self::Apply => "Apply",
            Self::Help => "Help",
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    pub name: CommandName,
    /// Empty means the default workspace.
    pub workspace: String,
    pub verbose: bool,
    /// Extra arguments passed through to terraform.
    pub flags: Vec<String>,
    /// Explicit project directory. When unset the projects are discovered
    /// from the files the pull request modifies.
    pub dir: Option<String>,
}

impl Command {
    pub fn new(name: CommandName) -> Self {
        Self { name, workspace: String::new(), verbose: false, flags: vec![], dir: None }
    }

    pub fn workspace(&self) -> &str {
        if self.workspace.is_empty() { DEFAULT_WORKSPACE } else { &self.workspace }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommentParseResult {
    /// Not addressed to us.
    Ignore,
    Help,
    /// Addressed to us but malformed; the message explains why.
    Invalid(String),
    Command(Command),
}

/// Parses pull request comments of the form
/// `<bot> plan|apply|help [workspace] [-d dir] [--verbose] [-- terraform flags]`.
pub struct CommentParser {
    bot_names: Vec<String>,
}

impl CommentParser {
    pub fn new(bot_names: Vec<String>) -> Self { Self { bot_names } }

    pub fn parse(&self, comment: &str) -> CommentParseResult {
        // Only the first line is a command; the rest of the comment is free text.
        let line = comment.trim().lines().next().unwrap_or_default();
        let mut args = line.split_whitespace();
        let Some(first) = args.next() else {
            return CommentParseResult::Ignore;
        };
        if !self.bot_names.iter().any(|name| name.eq_ignore_ascii_case(first)) {
            return CommentParseResult::Ignore;
        }
        let Some(sub_command) = args.next() else {
            return CommentParseResult::Help;
        };
        let name = match sub_command.parse::<CommandName>() {
            Ok(CommandName::Help) => return CommentParseResult::Help,
            Ok(name) => name,
            Err(()) if matches!(sub_command, "-h" | "--help") => return CommentParseResult::Help,
            Err(()) => {
                return CommentParseResult::Invalid(format!(
                    "`{sub_command}` is not a valid command."
                ));
            }
        };

        let mut command = Command::new(name);
        let mut workspace = None;
        while let Some(arg) = args.next() {
            match arg {
                "--" => {
                    command.flags.extend(args.by_ref().map(str::to_string));
                    break;
                }
                "-v" | "--verbose" => command.verbose = true,
                "-d" | "--dir" => {
                    let Some(dir) = args.next() else {
                        return CommentParseResult::Invalid(format!("`{arg}` requires a directory."));
                    };
                    let dir = clean_path(dir);
                    if dir.split('/').any(|c| c == "..") {
                        return CommentParseResult::Invalid(format!(
                            "Directory `{dir}` can't contain `..`."
                        ));
                    }
                    command.dir = Some(dir);
                }
                "-w" | "--workspace" => {
                    let Some(value) = args.next() else {
                        return CommentParseResult::Invalid(format!("`{arg}` requires a workspace."));
                    };
                    if workspace.replace(value).is_some() {
                        return CommentParseResult::Invalid("Workspace given twice.".to_string());
                    }
                }
                flag if flag.starts_with('-') => {
                    return CommentParseResult::Invalid(format!(
                        "Unknown flag `{flag}`. Use `--` to pass flags to terraform."
                    ));
                }
                value => {
                    if workspace.replace(value).is_some() {
                        return CommentParseResult::Invalid(format!("Unexpected argument `{value}`."));
                    }
                }
            }
        }
        if let Some(workspace) = workspace {
            if !valid_workspace(workspace) {
                return CommentParseResult::Invalid(format!(
                    "`{workspace}` is not a valid workspace name."
                ));
            }
            command.workspace = workspace.to_string();
        }
        CommentParseResult::Command(command)
    }
}

fn valid_workspace(workspace: &str) -> bool {
    !matches!(workspace, "." | "..")
        && workspace.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

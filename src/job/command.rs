//! Runner command templates.
//!
//! A template is a shell command line with placeholders that are replaced
//! literally (no quoting, no templating logic):
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{test_id}` | the test unit identifier (required) |
//! | `{build_id}` | the build identifier |
//! | `{workspace}` | the workspace directory, or an empty string |
//!
//! ```toml
//! [workspaces.api]
//! run_command = "python manage.py test --settings=ci {test_id}"
//! ```
//!
//! The rendered line runs through the sandbox shell, so pipes and redirects
//! work as usual.

use super::{BuildId, Job, TestUnit};
use crate::sandbox::Command;

pub const TEST_ID_PLACEHOLDER: &str = "{test_id}";
pub const BUILD_ID_PLACEHOLDER: &str = "{build_id}";
pub const WORKSPACE_PLACEHOLDER: &str = "{workspace}";

/// Errors raised while parsing a runner template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Runner command template is empty")]
    Empty,

    #[error("Runner command template has no {{test_id}} placeholder: {0}")]
    MissingTestId(String),
}

/// A validated runner command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    template: String,
}

impl CommandTemplate {
    /// Parses a template, requiring the `{test_id}` placeholder.
    ///
    /// # Example
    ///
    /// ```
    /// use drover::job::CommandTemplate;
    ///
    /// let template = CommandTemplate::parse("pytest {test_id}").unwrap();
    /// assert!(CommandTemplate::parse("pytest").is_err());
    /// # let _ = template;
    /// ```
    pub fn parse(template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }
        if !template.contains(TEST_ID_PLACEHOLDER) {
            return Err(TemplateError::MissingTestId(template));
        }
        Ok(Self { template })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitutes the placeholders and returns the concrete command line.
    pub fn render(&self, unit: &TestUnit, build_id: &BuildId, workspace: Option<&str>) -> String {
        self.template
            .replace(BUILD_ID_PLACEHOLDER, build_id.as_str())
            .replace(WORKSPACE_PLACEHOLDER, workspace.unwrap_or(""))
            .replace(TEST_ID_PLACEHOLDER, unit.id())
    }

    /// Binds a unit to a build, producing the job to enqueue.
    pub fn job(
        &self,
        id: super::JobId,
        unit: &TestUnit,
        build_id: &BuildId,
        workspace: Option<&str>,
    ) -> Job {
        Job {
            id,
            build_id: build_id.clone(),
            unit: unit.clone(),
            command: self.render(unit, build_id, workspace),
            workspace: workspace.map(str::to_string),
        }
    }
}

/// Turns a job into the sandbox command that executes it.
///
/// The runner environment carries `TEST_ID`, `BUILD_ID` and, when known,
/// `WORKSPACE`.
pub fn build_command(job: &Job) -> Command {
    let mut cmd = Command::script(&job.command)
        .env("TEST_ID", job.unit.id())
        .env("BUILD_ID", job.build_id.as_str());
    if let Some(workspace) = &job.workspace {
        cmd = cmd.env("WORKSPACE", workspace);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    #[test]
    fn test_parse_requires_test_id() {
        assert_eq!(CommandTemplate::parse("   "), Err(TemplateError::Empty));
        assert!(matches!(
            CommandTemplate::parse("make test"),
            Err(TemplateError::MissingTestId(_))
        ));
        assert!(CommandTemplate::parse("make test T={test_id}").is_ok());
    }

    #[test]
    fn test_render_substitutes_literally() {
        let template =
            CommandTemplate::parse("run --build {build_id} --ws '{workspace}' {test_id} {test_id}")
                .unwrap();
        let line = template.render(
            &TestUnit::new("pkg.mod.Case.test_x"),
            &BuildId::new("abc"),
            Some("/srv/drover/api"),
        );
        assert_eq!(
            line,
            "run --build abc --ws '/srv/drover/api' pkg.mod.Case.test_x pkg.mod.Case.test_x"
        );
    }

    #[test]
    fn test_render_without_workspace() {
        let template = CommandTemplate::parse("echo {workspace}{test_id}").unwrap();
        let line = template.render(&TestUnit::new("t"), &BuildId::new("b"), None);
        assert_eq!(line, "echo t");
    }

    #[test]
    fn test_unit_id_is_not_reinterpreted() {
        // An id that looks like a placeholder stays as-is.
        let template = CommandTemplate::parse("echo {test_id}").unwrap();
        let line = template.render(&TestUnit::new("{build_id}"), &BuildId::new("b"), None);
        assert_eq!(line, "echo {build_id}");
    }

    #[test]
    fn test_build_command_sets_runner_env() {
        let template = CommandTemplate::parse("echo {test_id}").unwrap();
        let job = template.job(
            JobId(1),
            &TestUnit::new("a"),
            &BuildId::new("b"),
            Some("/ws"),
        );
        let cmd = build_command(&job);
        assert_eq!(cmd.to_shell_string(), "echo a");
        assert!(cmd.env.contains(&("TEST_ID".to_string(), "a".to_string())));
        assert!(cmd.env.contains(&("BUILD_ID".to_string(), "b".to_string())));
        assert!(cmd.env.contains(&("WORKSPACE".to_string(), "/ws".to_string())));
    }
}

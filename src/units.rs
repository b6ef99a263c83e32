//! Where test units come from.
//!
//! Units are opaque identifiers, one per line, read from a file, a
//! discovery command's stdout, or the command line. [`UnitFilter`] narrows
//! the list with include/exclude regular expressions before dispatch.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use regex::Regex;

use crate::job::TestUnit;

/// Parses one unit per line.
///
/// Blank lines and `#` comments are skipped. Repeated ids are kept once, in
/// first-seen order.
pub fn parse_unit_list(text: &str) -> Vec<TestUnit> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.to_string()))
        .map(TestUnit::new)
        .collect()
}

/// Reads a unit list file.
pub fn read_units_file(path: &Path) -> anyhow::Result<Vec<TestUnit>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read units file {}", path.display()))?;
    Ok(parse_unit_list(&text))
}

/// Runs a discovery command through `shell -c` and parses its stdout.
pub async fn discover(
    command: &str,
    shell: &str,
    working_dir: Option<&Path>,
) -> anyhow::Result<Vec<TestUnit>> {
    let mut cmd = tokio::process::Command::new(shell);
    cmd.arg("-c").arg(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to run discovery command: {}", command))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        anyhow::bail!(
            "Discovery command exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }

    let units = parse_unit_list(&stdout);
    if units.is_empty() {
        tracing::warn!("No test units discovered. stderr: {}", stderr.trim());
    } else {
        tracing::info!("Discovered {} test units", units.len());
    }
    Ok(units)
}

/// Include/exclude regular expressions over unit ids.
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl UnitFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            include: include.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            exclude: exclude.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// A unit is kept when it matches any include (or none are given) and
    /// no exclude.
    pub fn keeps(&self, unit: &TestUnit) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|re| re.is_match(unit.id()));
        included && !self.exclude.iter().any(|re| re.is_match(unit.id()))
    }

    pub fn apply(&self, units: Vec<TestUnit>) -> Vec<TestUnit> {
        if self.is_empty() {
            return units;
        }
        let before = units.len();
        let kept: Vec<TestUnit> = units.into_iter().filter(|u| self.keeps(u)).collect();
        tracing::debug!("Filter kept {} of {} units", kept.len(), before);
        kept
    }
}

//! JUnit XML in both directions.
//!
//! **Reading.** A runner may print a JUnit/xunit report on stdout. The
//! report is located with [`extract`] and parsed with [`parse_suite`],
//! which sums the counts of every `<testsuite>` and itemizes failing,
//! erroring and skipped `<testcase>`s:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuite name="tests.test_api" tests="3" failures="1" errors="0" skipped="1" time="0.412">
//!   <testcase classname="tests.test_api.ApiTest" name="test_get" time="0.100"/>
//!   <testcase classname="tests.test_api.ApiTest" name="test_put" time="0.250">
//!     <failure type="AssertionError" message="404 != 200">Traceback ...</failure>
//!   </testcase>
//!   <testcase classname="tests.test_api.ApiTest" name="test_slow" time="0.000">
//!     <skipped message="needs network"/>
//!   </testcase>
//! </testsuite>
//! ```
//!
//! Parsing stops at the end of the root element, so output printed after
//! the report is ignored. Missing count attributes are derived from the
//! `<testcase>` children.
//!
//! **Writing.** [`write_junit`] turns an [`AggregateReport`] into one merged
//! JUnit file with a `<testcase>` per job.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use super::aggregate::AggregateReport;
use crate::job::JobResult;

#[derive(Debug, thiserror::Error)]
pub enum ReportParseError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Invalid attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("Invalid {attr} count {value:?}")]
    BadCount { attr: String, value: String },

    #[error("Root element <{0}> is not a test suite")]
    NotASuite(String),

    #[error("Report ends inside <{0}>")]
    Truncated(String),
}

/// Kind of an itemized test case outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseKind {
    Failure,
    Error,
    Skip,
}

impl CaseKind {
    /// Label used in transcripts.
    pub fn label(self) -> &'static str {
        match self {
            CaseKind::Failure => "FAIL",
            CaseKind::Error => "ERROR",
            CaseKind::Skip => "SKIP",
        }
    }

    fn from_element(name: &[u8]) -> Option<Self> {
        match name {
            b"failure" => Some(CaseKind::Failure),
            b"error" => Some(CaseKind::Error),
            b"skipped" | b"skip" => Some(CaseKind::Skip),
            _ => None,
        }
    }
}

/// One failing, erroring or skipped test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseEntry {
    pub kind: CaseKind,
    /// `classname.name`, or just `name` without a classname.
    pub name: String,
    /// Elapsed seconds as reported.
    pub time: f64,
    pub message: String,
    pub body: String,
}

/// Totals and itemized entries of one embedded report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub tests: usize,
    pub failures: usize,
    pub errors: usize,
    pub skips: usize,
    pub time: f64,
    pub cases: Vec<CaseEntry>,
}

/// What a job's stdout says about its structured report.
#[derive(Debug, Clone, PartialEq)]
pub enum Embedded {
    /// No report in the output.
    Absent,
    Parsed(SuiteReport),
    /// A report was started but could not be parsed.
    Malformed(String),
}

/// Returns the part of `stdout` where an embedded report starts.
pub fn embedded_xml(stdout: &str) -> Option<&str> {
    stdout
        .find("<?xml")
        .or_else(|| stdout.find("<testsuite"))
        .map(|start| &stdout[start..])
}

/// Locates and parses the report embedded in a job's stdout.
pub fn extract(stdout: &str) -> Embedded {
    match embedded_xml(stdout) {
        None => Embedded::Absent,
        Some(xml) => match parse_suite(xml) {
            Ok(report) => Embedded::Parsed(report),
            Err(e) => Embedded::Malformed(e.to_string()),
        },
    }
}

#[derive(Default)]
struct Counts {
    tests: usize,
    failures: usize,
    errors: usize,
    skips: usize,
}

/// Counts declared on a `<testsuite>` plus counts observed in its cases.
#[derive(Default)]
struct OpenSuite {
    declared: [Option<usize>; 4],
    observed: Counts,
    time: f64,
}

struct OpenCase {
    name: String,
    time: f64,
}

#[derive(Default)]
struct SuiteParser {
    report: SuiteReport,
    stack: Vec<String>,
    suite: Option<OpenSuite>,
    case: Option<OpenCase>,
    entry: Option<CaseEntry>,
}

impl SuiteParser {
    fn open(&mut self, element: &BytesStart<'_>) -> Result<(), ReportParseError> {
        let name = element.local_name();
        let name = name.as_ref();

        if self.stack.is_empty() && name != b"testsuites" && name != b"testsuite" {
            return Err(ReportParseError::NotASuite(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }

        match name {
            b"testsuite" => {
                let mut suite = OpenSuite::default();
                for (i, key) in ["tests", "failures", "errors", "skipped"].iter().enumerate() {
                    suite.declared[i] = count_attr(element, key)?;
                }
                if suite.declared[3].is_none() {
                    suite.declared[3] = count_attr(element, "skips")?;
                }
                suite.time = time_attr(element)?;
                self.suite = Some(suite);
            }
            b"testcase" => {
                if let Some(suite) = &mut self.suite {
                    suite.observed.tests += 1;
                }
                let classname = attr(element, "classname")?.unwrap_or_default();
                let case = attr(element, "name")?.unwrap_or_default();
                let name = if classname.is_empty() {
                    case
                } else {
                    format!("{}.{}", classname, case)
                };
                self.case = Some(OpenCase {
                    name,
                    time: time_attr(element)?,
                });
            }
            other => {
                if let (Some(kind), Some(case)) = (CaseKind::from_element(other), &self.case) {
                    if let Some(suite) = &mut self.suite {
                        match kind {
                            CaseKind::Failure => suite.observed.failures += 1,
                            CaseKind::Error => suite.observed.errors += 1,
                            CaseKind::Skip => suite.observed.skips += 1,
                        }
                    }
                    let message = match attr(element, "message")? {
                        Some(message) => message,
                        None => attr(element, "type")?.unwrap_or_default(),
                    };
                    self.entry = Some(CaseEntry {
                        kind,
                        name: case.name.clone(),
                        time: case.time,
                        message,
                        body: String::new(),
                    });
                }
            }
        }

        self.stack
            .push(String::from_utf8_lossy(name).into_owned());
        Ok(())
    }

    fn close(&mut self) {
        let Some(name) = self.stack.pop() else {
            return;
        };
        match name.as_str() {
            "testsuite" => {
                if let Some(suite) = self.suite.take() {
                    let [tests, failures, errors, skips] = suite.declared;
                    self.report.tests += tests.unwrap_or(suite.observed.tests);
                    self.report.failures += failures.unwrap_or(suite.observed.failures);
                    self.report.errors += errors.unwrap_or(suite.observed.errors);
                    self.report.skips += skips.unwrap_or(suite.observed.skips);
                    self.report.time += suite.time;
                }
            }
            "testcase" => self.case = None,
            _ => {
                if CaseKind::from_element(name.as_bytes()).is_some()
                    && let Some(mut entry) = self.entry.take()
                {
                    entry.body = entry.body.trim().to_string();
                    self.report.cases.push(entry);
                }
            }
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(entry) = &mut self.entry {
            entry.body.push_str(text);
        }
    }
}

/// Parses a JUnit/xunit document rooted at `<testsuite>` or `<testsuites>`.
///
/// # Errors
///
/// Any XML error, a non-numeric count attribute, a root element that is
/// not a test suite, or input that ends before the root is closed.
pub fn parse_suite(xml: &str) -> Result<SuiteReport, ReportParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parser = SuiteParser::default();
    let mut seen_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                parser.open(&element)?;
                seen_root = true;
            }
            Event::Empty(element) => {
                parser.open(&element)?;
                parser.close();
                seen_root = true;
            }
            Event::End(_) => parser.close(),
            Event::Text(text) => parser.text(&text.unescape()?),
            Event::CData(data) => parser.text(&String::from_utf8_lossy(&data.into_inner())),
            Event::Eof => {
                return Err(ReportParseError::Truncated(
                    parser.stack.last().cloned().unwrap_or_else(|| "testsuite".into()),
                ));
            }
            _ => {}
        }
        if seen_root && parser.stack.is_empty() {
            return Ok(parser.report);
        }
    }
}

fn attr(element: &BytesStart<'_>, key: &str) -> Result<Option<String>, ReportParseError> {
    for attribute in element.attributes() {
        let attribute = attribute?;
        if attribute.key.as_ref() == key.as_bytes() {
            return Ok(Some(attribute.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn count_attr(element: &BytesStart<'_>, key: &str) -> Result<Option<usize>, ReportParseError> {
    match attr(element, key)? {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ReportParseError::BadCount {
                attr: key.to_string(),
                value,
            }),
    }
}

/// Elapsed seconds; unparseable times count as zero.
fn time_attr(element: &BytesStart<'_>) -> Result<f64, ReportParseError> {
    Ok(attr(element, "time")?
        .and_then(|t| t.trim().replace(',', "").parse().ok())
        .unwrap_or(0.0))
}

/// Writes the merged JUnit XML for a build.
///
/// Each job becomes one `<testcase>`; the itemized entries of the job become
/// its `<failure>`, `<error>` and `<skipped>` children. Suite totals are the
/// aggregate totals.
pub fn write_junit(report: &AggregateReport, results: &[JobResult], path: &Path) -> anyhow::Result<()> {
    let xml = generate_xml(report, results)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, xml).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("JUnit XML written to: {}", path.display());
    Ok(())
}

/// Copies every job's embedded report to `<dir>/<test id>.xml`.
pub fn write_job_reports(dir: &Path, results: &[JobResult]) -> anyhow::Result<usize> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut written = 0;
    for result in results {
        if let Some(xml) = embedded_xml(&result.stdout) {
            let path = dir.join(format!("{}.xml", file_stem(&result.test_id)));
            std::fs::write(&path, xml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written += 1;
        }
    }
    Ok(written)
}

fn generate_xml(report: &AggregateReport, results: &[JobResult]) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let time = format!("{:.3}", report.duration.as_secs_f64());
    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("tests", report.tests.to_string().as_str()));
    testsuites.push_attribute(("failures", report.failures.to_string().as_str()));
    testsuites.push_attribute(("errors", report.errors.to_string().as_str()));
    testsuites.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuites))?;

    let mut testsuite = BytesStart::new("testsuite");
    let name = report
        .build_id
        .as_ref()
        .map(|id| format!("drover-{}", id))
        .unwrap_or_else(|| "drover".to_string());
    testsuite.push_attribute(("name", name.as_str()));
    testsuite.push_attribute(("tests", report.tests.to_string().as_str()));
    testsuite.push_attribute(("failures", report.failures.to_string().as_str()));
    testsuite.push_attribute(("errors", report.errors.to_string().as_str()));
    testsuite.push_attribute(("skipped", report.skips.to_string().as_str()));
    testsuite.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuite))?;

    let mut by_job: BTreeMap<&str, Vec<&super::aggregate::Entry>> = BTreeMap::new();
    for entry in &report.entries {
        by_job.entry(entry.job.as_str()).or_default().push(entry);
    }

    let mut ordered: Vec<&JobResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.test_id.cmp(&b.test_id));
    for result in ordered {
        let entries = by_job.remove(result.test_id.as_str()).unwrap_or_default();
        write_testcase(&mut writer, result, &entries)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &JobResult,
    entries: &[&super::aggregate::Entry],
) -> anyhow::Result<()> {
    let (classname, name) = parse_test_id(&result.test_id);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", name.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration().as_secs_f64()).as_str(),
    ));

    if entries.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;
    for entry in entries {
        let tag = match entry.kind {
            CaseKind::Failure => "failure",
            CaseKind::Error => "error",
            CaseKind::Skip => "skipped",
        };
        let mut element = BytesStart::new(tag);
        element.push_attribute(("message", sanitize(&entry.message).as_str()));
        if entry.kind != CaseKind::Skip {
            element.push_attribute(("type", entry.name.as_str()));
        }
        let body = sanitize(&entry.body);
        if body.is_empty() {
            writer.write_event(Event::Empty(element))?;
        } else {
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(&body)))?;
            writer.write_event(Event::End(BytesEnd::new(tag)))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Splits a test id into JUnit classname and name.
///
/// Dotted ids (`pkg.module.Class.test`) split at the last dot; pytest and
/// Rust style ids split at the last `::`.
fn parse_test_id(id: &str) -> (String, String) {
    if let Some(idx) = id.rfind("::") {
        let classname = id[..idx]
            .replace("::", ".")
            .replace('/', ".")
            .replace(".py", "")
            .replace(".rs", "");
        (classname, id[idx + 2..].to_string())
    } else if let Some(idx) = id.rfind('.') {
        (id[..idx].to_string(), id[idx + 1..].to_string())
    } else {
        ("drover".to_string(), id.to_string())
    }
}

/// Drops characters that XML 1.0 cannot carry. Escaping is left to the
/// writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

fn file_stem(test_id: &str) -> String {
    test_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="tests.test_api" tests="3" failures="1" errors="0" skipped="1" time="0.412">
  <testcase classname="tests.test_api.ApiTest" name="test_get" time="0.100"/>
  <testcase classname="tests.test_api.ApiTest" name="test_put" time="0.250">
    <failure type="AssertionError" message="404 != 200">Traceback &lt;most recent&gt;</failure>
  </testcase>
  <testcase classname="tests.test_api.ApiTest" name="test_slow" time="0.000">
    <skipped message="needs network"/>
  </testcase>
</testsuite>"#;

    #[test]
    fn test_parse_counts_and_entries() {
        let report = parse_suite(REPORT).unwrap();
        assert_eq!(report.tests, 3);
        assert_eq!(report.failures, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.skips, 1);
        assert!((report.time - 0.412).abs() < 1e-9);
        assert_eq!(report.cases.len(), 2);

        let failure = &report.cases[0];
        assert_eq!(failure.kind, CaseKind::Failure);
        assert_eq!(failure.name, "tests.test_api.ApiTest.test_put");
        assert_eq!(failure.message, "404 != 200");
        assert_eq!(failure.body, "Traceback <most recent>");

        assert_eq!(report.cases[1].kind, CaseKind::Skip);
        assert_eq!(report.cases[1].message, "needs network");
    }

    #[test]
    fn test_extract_ignores_surrounding_output() {
        let stdout = format!("setting up db\n{}\ntrailing <junk\n", REPORT);
        match extract(&stdout) {
            Embedded::Parsed(report) => assert_eq!(report.tests, 3),
            other => panic!("expected parsed report, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_absent() {
        assert_eq!(extract("ok\n"), Embedded::Absent);
    }

    #[test]
    fn test_truncated_report_is_malformed() {
        let cut = &REPORT[..REPORT.len() / 2];
        assert!(matches!(extract(cut), Embedded::Malformed(_)));
    }

    #[test]
    fn test_bad_count_is_malformed() {
        let xml = r#"<testsuite tests="three"></testsuite>"#;
        assert!(matches!(
            parse_suite(xml),
            Err(ReportParseError::BadCount { .. })
        ));
    }

    #[test]
    fn test_testsuites_root_sums_children() {
        let xml = r#"<testsuites tests="99">
  <testsuite tests="2" failures="0" errors="1" time="1.0">
    <testcase name="a"><error message="boom"><![CDATA[raw <trace>]]></error></testcase>
    <testcase name="b"/>
  </testsuite>
  <testsuite tests="1" failures="1" time="0.5">
    <testcase classname="m" name="c"><failure/></testcase>
  </testsuite>
</testsuites>"#;
        let report = parse_suite(xml).unwrap();
        assert_eq!(report.tests, 3);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(report.cases[0].body, "raw <trace>");
        assert_eq!(report.cases[1].name, "m.c");
    }

    #[test]
    fn test_missing_counts_are_derived() {
        let xml = r#"<testsuite name="x">
  <testcase name="a"/>
  <testcase name="b"><failure message="no"/></testcase>
  <testcase name="c"><skip/></testcase>
</testsuite>"#;
        let report = parse_suite(xml).unwrap();
        assert_eq!((report.tests, report.failures, report.skips), (3, 1, 1));
    }

    #[test]
    fn test_non_suite_root_is_rejected() {
        assert!(matches!(
            parse_suite("<html><body/></html>"),
            Err(ReportParseError::NotASuite(_))
        ));
    }

    #[test]
    fn test_parse_test_id() {
        assert_eq!(
            parse_test_id("tests/test_foo.py::TestClass::test_method"),
            ("tests.test_foo.TestClass".to_string(), "test_method".to_string())
        );
        assert_eq!(
            parse_test_id("tests.test_api.ApiTest"),
            ("tests.test_api".to_string(), "ApiTest".to_string())
        );
        assert_eq!(
            parse_test_id("simple"),
            ("drover".to_string(), "simple".to_string())
        );
    }

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize("a\u{1}b\tc"), "ab\tc");
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("tests/a.py::T::t"), "tests_a.py__T__t");
    }
}

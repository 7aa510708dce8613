//! Machine-parsable test summaries
//!
//! The engine reports raw facts only. When the test runner prints a
//! recognizable summary line, the counts are lifted out of stdout so review
//! does not have to scrape logs. Two formats are understood:
//! - pytest: `=== 1 failed, 3 passed in 0.12s ===`
//! - cargo test: `test result: FAILED. 3 passed; 1 failed; 0 ignored; ...`

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Test counts parsed from runner output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    /// Passing tests
    pub passed: u32,
    /// Failing tests
    pub failed: u32,
    /// Collection or setup errors
    pub errors: u32,
    /// Skipped or ignored tests
    pub skipped: u32,
}

impl TestSummary {
    /// Parse the last recognizable summary from runner output
    #[must_use]
    pub fn parse(output: &str) -> Option<Self> {
        parse_cargo(output).or_else(|| parse_pytest(output))
    }

    /// No failures and no errors
    #[inline]
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    /// Total tests that ran
    #[inline]
    #[must_use]
    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.errors
    }
}

impl std::fmt::Display for TestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} errors, {} skipped",
            self.passed, self.failed, self.errors, self.skipped
        )
    }
}

fn pytest_tail() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d+ (?:passed|failed|errors?|skipped)\b.*\bin [0-9.]+s\b")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

fn pytest_count() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) (passed|failed|errors?|skipped)\b")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

fn cargo_result() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"test result: (?:ok|FAILED)\. (\d+) passed; (\d+) failed; (\d+) ignored")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

fn parse_pytest(output: &str) -> Option<TestSummary> {
    let line = output.lines().rev().find(|l| pytest_tail().is_match(l))?;
    let mut summary = TestSummary::default();
    for cap in pytest_count().captures_iter(line) {
        let n: u32 = cap[1].parse().ok()?;
        match &cap[2] {
            "passed" => summary.passed += n,
            "failed" => summary.failed += n,
            "error" | "errors" => summary.errors += n,
            "skipped" => summary.skipped += n,
            _ => {}
        }
    }
    Some(summary)
}

// One `test result:` line per test binary; counts are summed.
fn parse_cargo(output: &str) -> Option<TestSummary> {
    let mut found = false;
    let mut summary = TestSummary::default();
    for cap in cargo_result().captures_iter(output) {
        found = true;
        summary.passed += cap[1].parse::<u32>().ok()?;
        summary.failed += cap[2].parse::<u32>().ok()?;
        summary.skipped += cap[3].parse::<u32>().ok()?;
    }
    found.then_some(summary)
}

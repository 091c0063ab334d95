//! Run summary built from the merged JUnit results file

use chrono::{DateTime, Utc};

use super::keys::RunKeys;
use super::manifest::{RunStatus, RunSummary, ShardStatus, SummaryLinks, TestTotals};

/// Sum the counters of every `<testsuite ...>` opening tag
///
/// `failures` and `errors` both count as failed. Missing or unparseable
/// attributes count as zero; `<testsuites>` wrappers are not counted.
pub fn parse_junit_totals(xml: &str) -> TestTotals {
    let mut total = 0u64;
    let mut failed = 0u64;
    let mut skipped = 0u64;

    let mut rest = xml;
    while let Some(pos) = rest.find("<testsuite") {
        let after = &rest[pos + "<testsuite".len()..];
        let Some(end) = after.find('>') else {
            break;
        };

        // `<testsuites` shares the prefix; require whitespace, `/` or `>` next
        let is_suite = after
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace() || c == '/' || c == '>');

        if is_suite {
            let attrs = &after[..end];
            total = total.saturating_add(attribute(attrs, "tests"));
            failed = failed
                .saturating_add(attribute(attrs, "failures"))
                .saturating_add(attribute(attrs, "errors"));
            skipped = skipped.saturating_add(attribute(attrs, "skipped"));
        }

        rest = &after[end..];
    }

    TestTotals {
        total,
        passed: total.saturating_sub(failed.saturating_add(skipped)),
        failed,
        skipped,
    }
}

fn attribute(attrs: &str, name: &str) -> u64 {
    let mut rest = attrs;
    while let Some(pos) = rest.find(name) {
        let preceded_by_space = rest[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| c.is_whitespace());
        let after = rest[pos + name.len()..].trim_start();

        if preceded_by_space && let Some(value) = after.strip_prefix('=') {
            let value = value.trim_start();
            let quote = value.chars().next();
            if let Some(q @ ('"' | '\'')) = quote
                && let Some(close) = value[1..].find(q)
            {
                return value[1..1 + close].trim().parse().unwrap_or(0);
            }
        }

        rest = &rest[pos + name.len()..];
    }
    0
}

/// Inputs of a run summary that are not derived from the results file
#[derive(Debug, Clone)]
pub struct SummaryContext {
    pub run_id: String,
    pub project: Option<String>,
    pub git_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn build_summary(context: SummaryContext, tests: TestTotals, shards: Vec<ShardStatus>) -> RunSummary {
    let keys = RunKeys::new(&context.run_id);
    let any_shard_failed = shards.iter().any(|s| s.exit_code != 0);
    let status = if tests.failed > 0 || any_shard_failed {
        RunStatus::Failed
    } else {
        RunStatus::Passed
    };

    let duration_secs = (context.finished_at - context.started_at).num_seconds().max(0) as u64;

    RunSummary {
        links: SummaryLinks {
            html_index: keys.final_html("index.html"),
            junit: keys.final_junit(),
        },
        run_id: context.run_id,
        project: context.project,
        git_ref: context.git_ref,
        started_at: context.started_at.to_rfc3339(),
        finished_at: context.finished_at.to_rfc3339(),
        duration_secs,
        status,
        tests,
        shards,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JUNIT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites id="" name="" tests="7" failures="1" skipped="1" errors="0" time="3.2">
<testsuite name="login.spec.ts" timestamp="2025-01-01T00:00:00" hostname="chromium" tests="4" failures="1" skipped="0" time="1.1" errors="0">
<testcase name="logs in" classname="login.spec.ts" time="0.5"></testcase>
</testsuite>
<testsuite name="cart.spec.ts" tests="3" failures="0" skipped="1" errors="1" time="2.1">
</testsuite>
</testsuites>"#;

    #[test]
    fn test_parse_totals_sums_suites_only() {
        let totals = parse_junit_totals(JUNIT);
        assert_eq!(
            totals,
            TestTotals {
                total: 7,
                passed: 4,
                failed: 2,
                skipped: 1,
            }
        );
    }

    #[test]
    fn test_parse_empty_document() {
        let totals =
            parse_junit_totals(r#"<?xml version="1.0" encoding="UTF-8"?><testsuites></testsuites>"#);
        assert_eq!(totals, TestTotals::default());
    }

    #[test]
    fn test_unparseable_attributes_count_as_zero() {
        let totals = parse_junit_totals(r#"<testsuite tests="abc" failures='2' skipped="">"#);
        assert_eq!(totals.total, 0);
        assert_eq!(totals.failed, 2);
        assert_eq!(totals.passed, 0);
    }

    #[test]
    fn test_huge_counters_saturate() {
        let max = u64::MAX;
        let xml = format!(
            r#"<testsuite tests="{max}" failures="{max}" errors="1" skipped="{max}"></testsuite>
<testsuite tests="5" failures="0" skipped="0"></testsuite>"#
        );
        let totals = parse_junit_totals(&xml);
        assert_eq!(totals.total, max);
        assert_eq!(totals.failed, max);
        assert_eq!(totals.skipped, max);
        assert_eq!(totals.passed, 0);
    }

    #[test]
    fn test_attribute_name_must_be_whole() {
        // `tests` must not match inside `subtests`
        let totals = parse_junit_totals(r#"<testsuite subtests="9" tests="3">"#);
        assert_eq!(totals.total, 3);
    }

    #[test]
    fn test_summary_fails_when_a_shard_exit_code_is_nonzero() {
        let started_at = Utc::now();
        let context = SummaryContext {
            run_id: "suite-x".to_string(),
            project: Some("suite".to_string()),
            git_ref: Some("main".to_string()),
            started_at,
            finished_at: started_at + chrono::Duration::seconds(42),
        };
        let tests = TestTotals {
            total: 2,
            passed: 2,
            failed: 0,
            skipped: 0,
        };
        let shards = vec![
            ShardStatus {
                index: 0,
                exit_code: 0,
            },
            ShardStatus {
                index: 1,
                exit_code: 1,
            },
        ];

        let summary = build_summary(context, tests, shards);
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.duration_secs, 42);
        assert_eq!(summary.links.junit, "suite-x/final/junit.xml");
    }
}

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Review/severity/test-gate canonical enum normalization.
//!
//! Normalization is always-total: every input string maps to a canonical
//! variant, defaulting conservatively on anything unrecognized. The variant
//! tables are kept as plain data so they can grow without touching the
//! fold/lookup logic.

use crate::value::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Approved,
    ApprovedWithNotes,
    NeedsFixes,
    Rejected,
}

const REVIEW_STATUS_TABLE: &[(ReviewStatus, &[&str])] = &[
    (
        ReviewStatus::Approved,
        &[
            "APPROVED",
            "PASS",
            "PASSED",
            "ACCEPT",
            "ACCEPTED",
            "OK",
            "LGTM",
            "NO_ISSUES",
            "NO_CHANGES_NEEDED",
        ],
    ),
    (
        ReviewStatus::ApprovedWithNotes,
        &[
            "APPROVED_WITH_NOTES",
            "APPROVED_WITH_COMMENTS",
            "CONDITIONAL_APPROVAL",
            "APPROVED_CONDITIONALLY",
        ],
    ),
    (
        ReviewStatus::Rejected,
        &["REJECTED", "REJECT", "FAIL", "FAILED", "CRITICAL", "BLOCKED"],
    ),
];

/// Upper + underscore fold: non-alphanumeric runs collapse to a single `_`.
fn fold(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

impl ReviewStatus {
    /// Total: every string maps into the canonical enum; unknown values
    /// (including null/whitespace) default to `NeedsFixes`.
    pub fn normalize(raw: Option<&str>) -> ReviewStatus {
        let raw = match raw {
            Some(s) if !s.trim().is_empty() => s,
            _ => return ReviewStatus::NeedsFixes,
        };
        let folded = fold(raw);
        for (canonical, variants) in REVIEW_STATUS_TABLE {
            if variants.contains(&folded.as_str()) {
                return *canonical;
            }
        }
        ReviewStatus::NeedsFixes
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::ApprovedWithNotes => "APPROVED_WITH_NOTES",
            ReviewStatus::NeedsFixes => "NEEDS_FIXES",
            ReviewStatus::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

const SEVERITY_TABLE: &[(Severity, &[&str])] = &[
    (Severity::Critical, &["CRITICAL"]),
    (Severity::High, &["HIGH"]),
    (Severity::Medium, &["MEDIUM", "MODERATE"]),
    (Severity::Low, &["LOW", "INFO", "INFORMATIONAL"]),
];

impl Severity {
    pub fn normalize(raw: Option<&str>) -> Severity {
        let raw = match raw {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Severity::Medium,
        };
        let folded = fold(raw);
        for (canonical, variants) in SEVERITY_TABLE {
            if variants.contains(&folded.as_str()) {
                return *canonical;
            }
        }
        Severity::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestGateStatus {
    Pass,
    Skipped,
    Error,
    Fail,
}

const TEST_GATE_TABLE: &[(TestGateStatus, &[&str])] = &[
    (TestGateStatus::Pass, &["PASS", "PASSED"]),
    (TestGateStatus::Skipped, &["SKIPPED", "SKIP"]),
    (TestGateStatus::Error, &["ERROR", "ERRORED"]),
    (TestGateStatus::Fail, &["FAIL", "FAILED"]),
];

impl TestGateStatus {
    pub fn normalize(raw: Option<&str>) -> TestGateStatus {
        let raw = match raw {
            Some(s) if !s.trim().is_empty() => s,
            _ => return TestGateStatus::Fail,
        };
        let folded = fold(raw);
        for (canonical, variants) in TEST_GATE_TABLE {
            if variants.contains(&folded.as_str()) {
                return *canonical;
            }
        }
        TestGateStatus::Fail
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub category: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_after: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReviewReport {
    pub overall_status: ReviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub summary: BTreeMap<Severity, u32>,
}

impl ReviewReport {
    /// Builds a summary count-by-severity from the findings list.
    pub fn with_computed_summary(overall_status: ReviewStatus, findings: Vec<Finding>) -> Self {
        let mut summary: BTreeMap<Severity, u32> = BTreeMap::new();
        for f in &findings {
            *summary.entry(f.severity).or_insert(0) += 1;
        }
        Self {
            overall_status,
            quality_score: None,
            findings,
            summary,
        }
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        rank(*self).cmp(&rank(*other))
    }
}
impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn rank(s: Severity) -> u8 {
    match s {
        Severity::Critical => 0,
        Severity::High => 1,
        Severity::Medium => 2,
        Severity::Low => 3,
    }
}

/// Best-effort recovery of an `overall_status` value from free text, used by
/// the LLM Step Factory's JSON-fallback parsing cascade.
pub fn recover_overall_status_from_text(text: &str) -> Option<String> {
    if let Some(idx) = text.find("overall_status") {
        let tail = &text[idx..];
        if let Some(colon) = tail.find(':') {
            let rest = tail[colon + 1..].trim_start();
            let value: String = rest
                .trim_start_matches(['"', '\''])
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    if text.to_lowercase().contains("approved: true") || text.to_lowercase().contains("\"approved\": true") {
        return Some("APPROVED".to_string());
    }
    if text.to_lowercase().contains("approved: false") || text.to_lowercase().contains("\"approved\": false") {
        return Some("NEEDS_FIXES".to_string());
    }
    None
}

/// Mirrors a `Value::Map` based review dict through the normalization
/// chain: alias `review` -> `review_report`, lift a nested status, derive
/// from `approved`, finally run the canonical normalizer.
pub fn normalize_review_output(output: &mut BTreeMap<String, Value>) {
    if !output.contains_key("review_report") {
        if let Some(review) = output.remove("review") {
            output.insert("review_report".to_string(), review);
        }
    }

    if !output.contains_key("review_report") {
        if let Some(Value::String(raw)) = output.get("raw_response").cloned() {
            if let Some(status) = recover_overall_status_from_text(&raw) {
                let mut map = std::collections::BTreeMap::new();
                map.insert("overall_status".to_string(), Value::String(status));
                output.insert("review_report".to_string(), Value::Map(map));
            }
        }
    }

    if let Some(top_status) = output.get("overall_status").cloned() {
        if let Some(Value::Map(report)) = output.get_mut("review_report") {
            report
                .entry("overall_status".to_string())
                .or_insert(top_status);
        }
    }

    if let Some(Value::Map(report)) = output.get_mut("review_report") {
        if !report.contains_key("overall_status") {
            if let Some(Value::Bool(approved)) = report.get("approved") {
                let status = if *approved { "APPROVED" } else { "NEEDS_FIXES" };
                report.insert("overall_status".to_string(), Value::String(status.to_string()));
            }
        }
        let raw_status = report.get("overall_status").and_then(|v| v.as_str());
        let normalized = ReviewStatus::normalize(raw_status);
        report.insert(
            "overall_status".to_string(),
            Value::String(normalized.as_str().to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_total_and_case_insensitive() {
        assert_eq!(ReviewStatus::normalize(Some("pass")), ReviewStatus::Approved);
        assert_eq!(
            ReviewStatus::normalize(Some("approved-with-notes")),
            ReviewStatus::ApprovedWithNotes
        );
        assert_eq!(ReviewStatus::normalize(Some("blocked")), ReviewStatus::Rejected);
        assert_eq!(ReviewStatus::normalize(Some("")), ReviewStatus::NeedsFixes);
        assert_eq!(ReviewStatus::normalize(None), ReviewStatus::NeedsFixes);
        assert_eq!(
            ReviewStatus::normalize(Some("something made up")),
            ReviewStatus::NeedsFixes
        );
    }

    #[test]
    fn severity_folds_moderate_into_medium() {
        assert_eq!(Severity::normalize(Some("moderate")), Severity::Medium);
        assert_eq!(Severity::normalize(Some("info")), Severity::Low);
        assert_eq!(Severity::normalize(None), Severity::Medium);
    }

    #[test]
    fn test_gate_defaults_to_fail() {
        assert_eq!(TestGateStatus::normalize(Some("bogus")), TestGateStatus::Fail);
        assert_eq!(TestGateStatus::normalize(Some("pass")), TestGateStatus::Pass);
    }

    #[test]
    fn derives_overall_status_from_approved_boolean() {
        let mut output = BTreeMap::new();
        let mut report = BTreeMap::new();
        report.insert("approved".to_string(), Value::Bool(true));
        output.insert("review_report".to_string(), Value::Map(report));
        normalize_review_output(&mut output);
        let report = output.get("review_report").unwrap().as_map().unwrap();
        assert_eq!(
            report.get("overall_status").unwrap().as_str(),
            Some("APPROVED")
        );
    }

    #[test]
    fn aliases_review_to_review_report() {
        let mut output = BTreeMap::new();
        let mut review = BTreeMap::new();
        review.insert("overall_status".to_string(), Value::String("PASS".to_string()));
        output.insert("review".to_string(), Value::Map(review));
        normalize_review_output(&mut output);
        assert!(output.contains_key("review_report"));
        assert!(!output.contains_key("review"));
    }
}

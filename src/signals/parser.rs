//! Signal parsing from agent output.
//!
//! Extracts signals from text using regex patterns for:
//! - `<discovery kind="blocker">description</discovery>`
//! - `<verdict>approve</verdict>` or `<verdict>revise</verdict>`
//! - `<issue>description</issue>`

use super::types::{AgentSignals, Discovery, DiscoveryKind};
use regex::Regex;
use std::sync::LazyLock;

static DISCOVERY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<discovery\s+kind\s*=\s*["']([\w-]+)["']\s*>(.*?)</discovery>"#).unwrap()
});

static VERDICT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<verdict>\s*([\w-]+)\s*</verdict>").unwrap());

static ISSUE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<issue>(.*?)</issue>").unwrap());

/// Parser for extracting signals from agent output.
pub struct SignalParser;

impl SignalParser {
    pub fn parse(text: &str) -> AgentSignals {
        let mut signals = AgentSignals::default();

        for cap in DISCOVERY_REGEX.captures_iter(text) {
            let (Some(kind), Some(detail)) = (cap.get(1), cap.get(2)) else {
                continue;
            };
            let detail = detail.as_str().trim();
            if detail.is_empty() {
                continue;
            }
            match kind.as_str().parse::<DiscoveryKind>() {
                Ok(kind) => {
                    tracing::debug!(%kind, detail, "signal: discovery");
                    signals.discoveries.push(Discovery::new(kind, detail));
                }
                Err(e) => tracing::debug!(error = %e, "ignoring discovery with unknown kind"),
            }
        }

        for cap in VERDICT_REGEX.captures_iter(text) {
            if let Some(word) = cap.get(1) {
                match parse_verdict(word.as_str()) {
                    Some(v) => signals.verdict = Some(v),
                    None => tracing::debug!(verdict = word.as_str(), "ignoring unknown verdict"),
                }
            }
        }

        for cap in ISSUE_REGEX.captures_iter(text) {
            if let Some(issue) = cap.get(1) {
                let issue = issue.as_str().trim();
                if !issue.is_empty() {
                    signals.issues.push(issue.to_string());
                }
            }
        }

        signals
    }
}

fn parse_verdict(word: &str) -> Option<bool> {
    match word.to_ascii_lowercase().as_str() {
        "approve" | "approved" | "lgtm" | "pass" => Some(true),
        "revise" | "reject" | "rejected" | "changes" | "fail" => Some(false),
        _ => None,
    }
}

/// Convenience function to extract signals.
pub fn extract_signals(text: &str) -> AgentSignals {
    SignalParser::parse(text)
}

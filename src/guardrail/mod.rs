//! Safety guardrail scanner for transcript text.
//!
//! A pure function over a transcript fragment (partial or final): scans for
//! a fixed set of crisis keyword patterns and returns an [`EmergencyEvent`]
//! when one matches. The scanner runs identically on whichever transcript
//! source is active; deduplication across sources happens in the session,
//! keyed by utterance.

use std::fmt;

use once_cell::sync::Lazy;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// Severity tier of a detected emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencySeverity {
    /// Worth surfacing, no interruption.
    Advisory,
    /// Prominent banner, no interruption.
    Urgent,
    /// Playback must be interrupted immediately.
    Critical,
}

impl fmt::Display for EmergencySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencySeverity::Advisory => write!(f, "advisory"),
            EmergencySeverity::Urgent => write!(f, "urgent"),
            EmergencySeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Emergency signal derived from a transcript fragment. Never persisted,
/// recomputed per fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyEvent {
    pub severity: EmergencySeverity,
    /// When true the session must trigger the same stop-audio path as
    /// barge-in before anything else.
    pub interrupt: bool,
    /// Banner text for the caller to display.
    pub banner: String,
}

struct Pattern {
    regex: regex::Regex,
    severity: EmergencySeverity,
    banner: &'static str,
}

fn pattern(expr: &str, severity: EmergencySeverity, banner: &'static str) -> Pattern {
    Pattern {
        regex: RegexBuilder::new(expr)
            .case_insensitive(true)
            .build()
            .expect("guardrail pattern must compile"),
        severity,
        banner,
    }
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        pattern(
            r"(can'?t|cannot|trouble|difficulty|hard to|struggling to)\s+breath",
            EmergencySeverity::Critical,
            "Breathing difficulty reported. Call emergency services now.",
        ),
        pattern(
            r"throat\s+(is\s+)?(closing|swelling|tight)",
            EmergencySeverity::Critical,
            "Possible airway swelling. Call emergency services now.",
        ),
        pattern(
            r"anaphyla",
            EmergencySeverity::Critical,
            "Possible anaphylaxis. Call emergency services now.",
        ),
        pattern(
            r"(passed out|passing out|unconscious|fainted|losing consciousness)",
            EmergencySeverity::Critical,
            "Loss of consciousness reported. Call emergency services now.",
        ),
        pattern(
            r"(call|need)\s+(911|999|112|an?\s+ambulance)",
            EmergencySeverity::Critical,
            "Emergency services requested.",
        ),
        pattern(
            r"(tongue|lips?|face)\s+(is\s+|are\s+)?swell",
            EmergencySeverity::Urgent,
            "Facial swelling reported. Seek urgent medical care.",
        ),
        pattern(
            r"(epi\s?pen|epinephrine|adrenaline\s+auto)",
            EmergencySeverity::Urgent,
            "Epinephrine mentioned. Seek urgent medical care.",
        ),
        pattern(
            r"wheez",
            EmergencySeverity::Urgent,
            "Wheezing reported. Seek urgent medical care.",
        ),
        pattern(
            r"(hives\s+(all\s+)?over|whole\s+body\s+rash)",
            EmergencySeverity::Urgent,
            "Widespread hives reported. Seek urgent medical care.",
        ),
        pattern(
            r"(dizzy|light.?headed|faint\b)",
            EmergencySeverity::Advisory,
            "Dizziness reported. Monitor symptoms closely.",
        ),
        pattern(
            r"(vomit|throwing up)",
            EmergencySeverity::Advisory,
            "Vomiting reported. Monitor symptoms closely.",
        ),
    ]
});

/// Scan a transcript fragment for crisis keywords.
///
/// Returns the highest-severity match, or `None` when the fragment is clean.
/// Only [`EmergencySeverity::Critical`] sets the interrupt flag.
pub fn scan(text: &str) -> Option<EmergencyEvent> {
    let mut best: Option<&Pattern> = None;
    for candidate in PATTERNS.iter() {
        if candidate.regex.is_match(text)
            && best.is_none_or(|current| candidate.severity > current.severity)
        {
            best = Some(candidate);
        }
    }

    best.map(|p| EmergencyEvent {
        severity: p.severity,
        interrupt: p.severity == EmergencySeverity::Critical,
        banner: p.banner.to_string(),
    })
}

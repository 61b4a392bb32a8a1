//! Best-effort classification of free-form worker narration.
//!
//! The structured status channel is the authoritative progress signal; this
//! module is the explicit fallback for deciding, after exit, whether the
//! worker's own words claim a completed save. It is inherently fuzzy and
//! returns `Unknown` rather than guessing.

use std::path::Path;

use regex::Regex;

/// Verdict of the narration scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    /// Narration claims the output was saved.
    Complete,
    /// No clear completion claim found.
    Unknown,
}

/// Classification result with any paths the narration mentioned.
#[derive(Debug, Clone)]
pub struct NarrationOutcome {
    pub class: OutcomeClass,
    /// The line that triggered the `Complete` classification.
    pub summary: Option<String>,
    /// Paths under the shared root mentioned in that line, best effort.
    pub paths: Vec<String>,
}

impl NarrationOutcome {
    fn unknown() -> Self {
        Self {
            class: OutcomeClass::Unknown,
            summary: None,
            paths: Vec::new(),
        }
    }
}

/// Scan worker narration for a completion claim, newest lines first.
///
/// Looks for "saved to" / "saved the" phrasing and extracts any paths under
/// `shared_root` from the matching line.
pub fn classify_narration(narration: &str, shared_root: &Path) -> NarrationOutcome {
    let pattern = format!(
        r#"{}[/\\][^\s"']+"#,
        regex::escape(&shared_root.to_string_lossy())
    );
    let Ok(path_re) = Regex::new(&pattern) else {
        return NarrationOutcome::unknown();
    };

    for line in narration.lines().rev() {
        let lower = line.to_lowercase();
        if lower.contains("saved to") || lower.contains("saved the") {
            let paths = path_re
                .find_iter(line)
                .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
                .collect();
            return NarrationOutcome {
                class: OutcomeClass::Complete,
                summary: Some(line.trim().to_string()),
                paths,
            };
        }
    }

    NarrationOutcome::unknown()
}

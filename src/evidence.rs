//! Crash-evidence extraction
//!
//! Turns the raw output of a crashed sandbox run into structured evidence.
//! Extraction is an ordered list of rules applied to the tail of the
//! combined output; the first rule that matches anywhere in the tail wins.
//! No match is still a crash, just one without a pinpointed location.

use regex::Regex;

use crate::model::CrashEvidence;

/// How many trailing non-empty lines of combined output are scanned.
const TAIL_LINES: usize = 25;

enum Rule {
    /// `path:line` anywhere in a line, e.g. `/app/src/index.js:42: TypeError`.
    FileLine(Regex),
    /// `deprecated <api>` warnings, e.g. `crypto.createCipher is deprecated`.
    DeprecatedApi(Regex),
}

pub struct EvidenceExtractor {
    rules: Vec<Rule>,
}

impl Default for EvidenceExtractor {
    fn default() -> Self {
        let mut rules = Vec::new();
        if let Ok(re) = Regex::new(r"([/\w.\-]+):(\d+)") {
            rules.push(Rule::FileLine(re));
        }
        if let Ok(re) = Regex::new(r"(?i)deprecated\s+(\w+)") {
            rules.push(Rule::DeprecatedApi(re));
        }
        Self { rules }
    }
}

impl EvidenceExtractor {
    /// Build evidence for a crashed run from its captured output.
    pub fn extract(&self, stdout: &str, stderr: &str, exit_code: Option<i32>) -> CrashEvidence {
        let tail = tail_lines(stdout, stderr);
        let stacktrace = if tail.is_empty() {
            stderr.trim().to_string()
        } else {
            tail.join("\n")
        };

        let evidence = CrashEvidence {
            stacktrace,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            ..CrashEvidence::default()
        };

        for rule in &self.rules {
            match rule {
                Rule::FileLine(re) => {
                    for line in &tail {
                        if let Some(caps) = re.captures(line) {
                            if let Ok(number) = caps[2].parse::<u32>() {
                                return evidence.with_location(caps[1].to_string(), number);
                            }
                        }
                    }
                }
                Rule::DeprecatedApi(re) => {
                    for line in &tail {
                        if let Some(caps) = re.captures(line) {
                            return evidence.with_api(caps[1].to_string());
                        }
                    }
                }
            }
        }

        evidence
    }
}

/// Last `TAIL_LINES` non-empty lines of stdout and stderr combined, trimmed.
fn tail_lines(stdout: &str, stderr: &str) -> Vec<String> {
    let lines: Vec<String> = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..].to_vec()
}

//! Subject naming and NATS wildcard overlap detection.
//!
//! Grounded in `event_bus::InMemoryBus::matches_pattern` (`*` = one token,
//! `>` = one-or-more trailing tokens) but split out as a standalone,
//! symmetric `overlap` relation: `matches_pattern` only needs to answer
//! "does this pattern cover that concrete subject", while the topology
//! reconciler (spec §4.1) needs the more general "do these two patterns
//! (both possibly wildcarded) ever address the same concrete subject".

/// Build the domain-traffic subject an app publishes to its counterpart on:
/// `<producer>.sync.<destination>`.
pub fn sync_subject(producer: &str, destination: &str) -> String {
    format!("{producer}.sync.{destination}")
}

/// Build the dead-letter subject for a producer/destination pair:
/// `<producer>.sync.<destination>.dlq`.
pub fn dlq_subject(producer: &str, destination: &str) -> String {
    format!("{producer}.sync.{destination}.dlq")
}

/// Build the broker stream name for an environment: `<env>-jetstream-bridge-stream`.
pub fn stream_name(env: &str) -> String {
    format!("{env}-jetstream-bridge-stream")
}

/// Build the durable consumer name for an app/destination pair: `<app>--<dest>`.
pub fn consumer_name(app: &str, destination: &str) -> String {
    format!("{app}--{destination}")
}

/// Split a subject or pattern into its dot-separated tokens.
fn tokens(pattern: &str) -> Vec<&str> {
    pattern.split('.').collect()
}

/// Does `pattern` cover the concrete `subject` under NATS wildcard semantics?
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens
/// and must appear as the pattern's last token.
pub fn covered_by(pattern: &str, subject: &str) -> bool {
    let pattern_tokens = tokens(pattern);
    let subject_tokens = tokens(subject);

    let mut p = pattern_tokens.iter();
    let mut s = subject_tokens.iter();

    loop {
        match (p.next(), s.next()) {
            (Some(&">"), Some(_)) => return true,
            (Some(&"*"), Some(_)) => continue,
            (Some(pt), Some(st)) => {
                if pt != st {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Does any pattern in `patterns` cover the concrete `subject`?
pub fn covered(patterns: &[String], subject: &str) -> bool {
    patterns.iter().any(|p| covered_by(p, subject))
}

/// Do two subject patterns (each possibly containing wildcards) overlap —
/// i.e. is there some concrete subject both would match?
///
/// Tokens are compared position by position: equal literal tokens match,
/// `*` matches any single token on the other side, and `>` absorbs the
/// rest of both patterns (since whatever remains on the other side, `>`
/// would match it). `overlap(a, b) == overlap(b, a)` by construction — the
/// token loop treats both patterns symmetrically.
pub fn overlap(a: &str, b: &str) -> bool {
    let a_tokens = tokens(a);
    let b_tokens = tokens(b);

    let mut ai = a_tokens.iter();
    let mut bi = b_tokens.iter();

    loop {
        match (ai.next(), bi.next()) {
            (Some(&">"), _) | (_, Some(&">")) => return true,
            (Some(&"*"), Some(_)) | (Some(_), Some(&"*")) => continue,
            (Some(at), Some(bt)) => {
                if at != bt {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A cache of subject patterns claimed by one or more foreign streams,
/// used to classify a desired subject set into `allowed` (no conflict) and
/// `blocked` (overlaps something already claimed elsewhere).
#[derive(Debug, Default, Clone)]
pub struct SubjectMatcher {
    foreign_patterns: Vec<String>,
}

impl SubjectMatcher {
    /// Build a matcher over the subject patterns owned by other streams.
    pub fn new(foreign_patterns: Vec<String>) -> Self {
        Self { foreign_patterns }
    }

    /// True if `subject` overlaps any foreign pattern.
    pub fn conflicts(&self, subject: &str) -> bool {
        self.foreign_patterns.iter().any(|p| overlap(p, subject))
    }

    /// Partition `desired` into (allowed, blocked) against the foreign set.
    pub fn partition(&self, desired: &[String]) -> (Vec<String>, Vec<String>) {
        let mut allowed = Vec::new();
        let mut blocked = Vec::new();
        for subject in desired {
            if self.conflicts(subject) {
                blocked.push(subject.clone());
            } else {
                allowed.push(subject.clone());
            }
        }
        (allowed, blocked)
    }
}

/// Normalize a desired subject set: flatten, trim empty entries, dedupe,
/// preserving first-seen order.
pub fn normalize_subjects<I, S>(desired: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in desired {
        let s = item.into();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_subject_form() {
        assert_eq!(sync_subject("api", "worker"), "api.sync.worker");
    }

    #[test]
    fn dlq_subject_form() {
        assert_eq!(dlq_subject("api", "worker"), "api.sync.worker.dlq");
    }

    #[test]
    fn stream_name_form() {
        assert_eq!(stream_name("prod"), "prod-jetstream-bridge-stream");
    }

    #[test]
    fn consumer_name_form() {
        assert_eq!(consumer_name("api", "worker"), "api--worker");
    }

    #[test]
    fn covered_by_exact() {
        assert!(covered_by("one.two", "one.two"));
        assert!(!covered_by("one.two", "one.three"));
    }

    #[test]
    fn covered_by_single_wildcard() {
        assert!(covered_by("one.*", "one.two"));
        assert!(!covered_by("one.*", "one.two.three"));
    }

    #[test]
    fn covered_by_trailing_wildcard() {
        assert!(covered_by("one.>", "one.two.three"));
        assert!(covered_by("one.>", "one.two"));
        assert!(!covered_by("one.>", "two.one"));
    }

    #[test]
    fn overlap_is_symmetric_for_sample_patterns() {
        let cases = [
            ("one.*", "one.two"),
            ("one.>", "one.two.three"),
            ("one.two", "one.three"),
            ("*.two", "one.*"),
            ("a.b.c", "a.>"),
            ("x.y", "x.y.z"),
        ];
        for (a, b) in cases {
            assert_eq!(overlap(a, b), overlap(b, a), "overlap({a}, {b}) not symmetric");
        }
    }

    #[test]
    fn overlap_detects_conflicts() {
        assert!(overlap("one.*", "one.x"));
        assert!(overlap("one.>", "one.x.y"));
        assert!(!overlap("one.x", "two.x"));
    }

    #[test]
    fn subject_matcher_partitions() {
        let matcher = SubjectMatcher::new(vec!["one.*".to_string()]);
        let (allowed, blocked) = matcher.partition(&["one.x".to_string(), "two.x".to_string()]);
        assert_eq!(allowed, vec!["two.x".to_string()]);
        assert_eq!(blocked, vec!["one.x".to_string()]);
    }

    #[test]
    fn normalize_subjects_dedupes_and_trims() {
        let out = normalize_subjects(vec!["  a.b ", "", "a.b", "c.d"]);
        assert_eq!(out, vec!["a.b".to_string(), "c.d".to_string()]);
    }
}

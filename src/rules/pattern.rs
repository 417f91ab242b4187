//! Ant-style path patterns.
//!
//! Patterns are split on `/`. A `**` segment matches zero or more whole
//! segments, `*` matches any run of characters inside one segment and `?`
//! matches exactly one character. `/test/**` therefore matches `/test`,
//! `/test/a` and `/test/a/b/c`.

const WILDCARDS: &[char] = &['*', '?'];

/// One compiled segment of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Glob(String),
    AnySegments,
}

/// A compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    literal_prefix_len: usize,
}

impl PathPattern {
    /// Compile a pattern such as `/api/*/users/**`.
    pub fn new(raw: &str) -> Self {
        let segments = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Segment::AnySegments
                } else if s.contains(WILDCARDS) {
                    Segment::Glob(s.to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();

        let literal_prefix_len = raw.find(WILDCARDS).unwrap_or(raw.len());

        Self {
            raw: raw.to_string(),
            segments,
            literal_prefix_len,
        }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Length of the pattern text before its first wildcard.
    ///
    /// Longer prefixes are more specific and win when several rules match.
    pub fn specificity(&self) -> usize {
        self.literal_prefix_len
    }

    /// Whether the pattern is the catch-all `/**`.
    pub fn is_global(&self) -> bool {
        self.segments == [Segment::AnySegments]
    }

    /// Test a request path against the pattern.
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match_segments(&self.segments, &parts)
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((Segment::AnySegments, rest)) => {
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((Segment::Literal(lit), rest)) => path
            .split_first()
            .is_some_and(|(head, tail)| lit == head && match_segments(rest, tail)),
        Some((Segment::Glob(glob), rest)) => path
            .split_first()
            .is_some_and(|(head, tail)| glob_match(glob, head) && match_segments(rest, tail)),
    }
}

/// Match `text` against a single-segment glob supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

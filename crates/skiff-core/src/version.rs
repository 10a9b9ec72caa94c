//! npm-flavoured SemVer ranges on top of `semver::Version`.
//!
//! The `semver` crate supplies version parsing and SemVer 2.0.0 precedence,
//! but npm range grammar (`^`, `~`, `x`, `*`, hyphen ranges, whitespace AND
//! sets) is wider than cargo's, so ranges are parsed and evaluated here.

use semver::Version;

use crate::error::{Error, Result};

/// Parse a version string. Accepts a leading `v` or `=` and pads missing
/// minor/patch components with zeroes ("1.2" parses as 1.2.0).
pub fn parse_version(input: &str) -> Result<Version> {
    let s = input.trim().trim_start_matches('=').trim_start_matches('v').trim();
    if s.is_empty() {
        return Err(Error::InvalidVersion(input.to_string()));
    }
    if let Ok(v) = Version::parse(s) {
        return Ok(v);
    }
    // "1" or "1.2" style shorthand.
    let padded = pad_partial(s).ok_or_else(|| Error::InvalidVersion(input.to_string()))?;
    Version::parse(&padded).map_err(|_| Error::InvalidVersion(input.to_string()))
}

fn pad_partial(s: &str) -> Option<String> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return None;
    }
    if !parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    Some(match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        _ => format!("{}.{}.0", parts[0], parts[1]),
    })
}

/// True when the string looks like a plain version (optionally `v`/`=` prefixed),
/// as opposed to a range expression.
pub fn is_exact_version(spec: &str) -> bool {
    parse_version(spec).is_ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Exact,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A single comparator, e.g. `>=1.2.3`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        match self.op {
            Op::Exact => *v == self.version,
            Op::Gt => *v > self.version,
            Op::Gte => *v >= self.version,
            Op::Lt => *v < self.version,
            Op::Lte => *v <= self.version,
        }
    }
}

/// An AND-set of comparators. An empty set matches every version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Range {
    comparators: Vec<Comparator>,
}

impl Range {
    /// The range that matches anything (`*`).
    pub fn any() -> Self {
        Range { comparators: Vec::new() }
    }

    /// The exact version this range pins, when it is a single `=` comparator.
    pub fn as_exact(&self) -> Option<&Version> {
        match self.comparators.as_slice() {
            [c] if c.op == Op::Exact => Some(&c.version),
            _ => None,
        }
    }

    /// Parse an npm range expression.
    pub fn parse(input: &str) -> Result<Self> {
        let spec = input.trim();
        if spec.is_empty() || spec == "*" || spec == "x" || spec == "X" || spec == "latest" {
            return Ok(Range::any());
        }

        // Hyphen range: "A - B" (the spaces are part of the grammar).
        if let Some((lo, hi)) = spec.split_once(" - ") {
            let lo = parse_version(lo)?;
            let hi = parse_version(hi)?;
            return Ok(Range {
                comparators: vec![
                    Comparator { op: Op::Gte, version: lo },
                    Comparator { op: Op::Lte, version: hi },
                ],
            });
        }

        let mut comparators = Vec::new();
        for part in spec.split_whitespace() {
            parse_single(part, &mut comparators)
                .map_err(|_| Error::InvalidRange(input.to_string()))?;
        }
        if comparators.is_empty() {
            return Ok(Range::any());
        }
        Ok(Range { comparators })
    }

    /// SemVer satisfaction with npm's prerelease rule: a prerelease version
    /// only matches when some comparator mentions a prerelease of the same
    /// `major.minor.patch` tuple.
    pub fn satisfies(&self, v: &Version) -> bool {
        if !self.comparators.iter().all(|c| c.matches(v)) {
            return false;
        }
        if v.pre.is_empty() || self.comparators.is_empty() {
            return true;
        }
        self.comparators.iter().any(|c| {
            !c.version.pre.is_empty()
                && c.version.major == v.major
                && c.version.minor == v.minor
                && c.version.patch == v.patch
        })
    }

    /// The maximal version in `versions` satisfying this range.
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a str>,
    {
        versions
            .into_iter()
            .filter_map(|s| parse_version(s).ok())
            .filter(|v| self.satisfies(v))
            .max()
    }
}

/// Parse one whitespace-delimited token into comparators.
fn parse_single(token: &str, out: &mut Vec<Comparator>) -> Result<()> {
    if token == "*" || token == "x" || token == "X" {
        return Ok(());
    }

    if let Some(rest) = token.strip_prefix('^') {
        let v = parse_version(rest)?;
        let upper = if v.major > 0 {
            Version::new(v.major + 1, 0, 0)
        } else if v.minor > 0 {
            Version::new(0, v.minor + 1, 0)
        } else {
            Version::new(0, 0, v.patch + 1)
        };
        out.push(Comparator { op: Op::Gte, version: v });
        out.push(Comparator { op: Op::Lt, version: upper });
        return Ok(());
    }

    if let Some(rest) = token.strip_prefix('~') {
        let v = parse_version(rest)?;
        let upper = Version::new(v.major, v.minor + 1, 0);
        out.push(Comparator { op: Op::Gte, version: v });
        out.push(Comparator { op: Op::Lt, version: upper });
        return Ok(());
    }

    for (text, op) in [(">=", Op::Gte), ("<=", Op::Lte), (">", Op::Gt), ("<", Op::Lt), ("=", Op::Exact)]
    {
        if let Some(rest) = token.strip_prefix(text) {
            out.push(Comparator { op, version: parse_version(rest)? });
            return Ok(());
        }
    }

    // "1.2.x" / "1.x" wildcard patch or minor.
    if let Some(range) = parse_wildcard(token) {
        out.extend(range);
        return Ok(());
    }

    // Bare version: exact match.
    let v = parse_version(token)?;
    out.push(Comparator { op: Op::Exact, version: v });
    Ok(())
}

fn parse_wildcard(token: &str) -> Option<Vec<Comparator>> {
    let parts: Vec<&str> = token.split('.').collect();
    let is_wild = |p: &str| p == "x" || p == "X" || p == "*";
    match parts.as_slice() {
        [major, rest] if is_wild(rest) => {
            let major: u64 = major.parse().ok()?;
            Some(vec![
                Comparator { op: Op::Gte, version: Version::new(major, 0, 0) },
                Comparator { op: Op::Lt, version: Version::new(major + 1, 0, 0) },
            ])
        }
        [major, minor, rest] if is_wild(rest) => {
            let major: u64 = major.parse().ok()?;
            let minor: u64 = minor.parse().ok()?;
            Some(vec![
                Comparator { op: Op::Gte, version: Version::new(major, minor, 0) },
                Comparator { op: Op::Lt, version: Version::new(major, minor + 1, 0) },
            ])
        }
        _ => None,
    }
}

/// Compare two version strings by SemVer precedence.
pub fn compare(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

//! Portable glob matching for grant resource patterns.
//!
//! Semantics are OS-independent and segment-bounded: `*` matches any run
//! of characters within a `/`-separated segment, `?` matches any single
//! non-separator character, `[...]` matches character classes (ranges and
//! `^` negation), and `\` escapes the next pattern character. A pattern
//! must match the whole resource; there is no substring fallback.

/// Whether `resource` satisfies a grant's `pattern`.
///
/// Empty patterns and the bare `*` match everything. Malformed patterns
/// (unterminated class, trailing escape) match nothing.
#[must_use]
pub fn match_resource(pattern: &str, resource: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    matches!(glob_match(pattern, resource), Ok(true))
}

struct BadPattern;

fn glob_match(pattern: &str, name: &str) -> Result<bool, BadPattern> {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    match_from(&p, &n)
}

fn match_from(p: &[char], n: &[char]) -> Result<bool, BadPattern> {
    if p.is_empty() {
        return Ok(n.is_empty());
    }
    match p[0] {
        '*' => {
            // Collapse consecutive stars, then try every split of the
            // current segment (a star never crosses '/').
            let rest = &p[1..];
            for skip in 0..=n.len() {
                if match_from(rest, &n[skip..])? {
                    return Ok(true);
                }
                if skip < n.len() && n[skip] == '/' {
                    break;
                }
            }
            Ok(false)
        }
        '?' => {
            if n.is_empty() || n[0] == '/' {
                return Ok(false);
            }
            match_from(&p[1..], &n[1..])
        }
        '[' => {
            let (matched, consumed) = match_class(&p[1..], n.first().copied())?;
            if n.is_empty() || n[0] == '/' || !matched {
                return Ok(false);
            }
            match_from(&p[1 + consumed..], &n[1..])
        }
        '\\' => {
            let Some(&escaped) = p.get(1) else {
                return Err(BadPattern);
            };
            if n.first() != Some(&escaped) {
                return Ok(false);
            }
            match_from(&p[2..], &n[1..])
        }
        literal => {
            if n.first() != Some(&literal) {
                return Ok(false);
            }
            match_from(&p[1..], &n[1..])
        }
    }
}

/// Matches one `[...]` class against `c`. Returns whether it matched and
/// how many pattern chars the class consumed (including the closing `]`).
fn match_class(p: &[char], c: Option<char>) -> Result<(bool, usize), BadPattern> {
    let mut i = 0;
    let negated = matches!(p.first(), Some('^') | Some('!'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut saw_range = false;
    loop {
        let Some(&ch) = p.get(i) else {
            return Err(BadPattern);
        };
        if ch == ']' && saw_range {
            break;
        }
        saw_range = true;
        let lo = if ch == '\\' {
            i += 1;
            *p.get(i).ok_or(BadPattern)?
        } else {
            ch
        };
        i += 1;
        let hi = if p.get(i) == Some(&'-') && p.get(i + 1).is_some_and(|&c| c != ']') {
            i += 1;
            let hc = *p.get(i).ok_or(BadPattern)?;
            let hi = if hc == '\\' {
                i += 1;
                *p.get(i).ok_or(BadPattern)?
            } else {
                hc
            };
            i += 1;
            hi
        } else {
            lo
        };
        if lo > hi {
            return Err(BadPattern);
        }
        if let Some(c) = c {
            if c >= lo && c <= hi {
                matched = true;
            }
        }
    }
    if c == Some('/') {
        return Ok((false, i + 1));
    }
    Ok((matched ^ negated && c.is_some(), i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_bare_star_match_everything() {
        assert!(match_resource("", "anything"));
        assert!(match_resource("*", "anything"));
        assert!(match_resource("*", ""));
    }

    #[test]
    fn exact_matches() {
        assert!(match_resource("proj/TICKET-1", "proj/TICKET-1"));
        assert!(!match_resource("proj/TICKET-1", "proj/TICKET-2"));
        assert!(!match_resource("proj/TICKET-1", "proj/TICKET-10"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        assert!(match_resource("proj/*", "proj/TICKET-1"));
        assert!(!match_resource("proj/*", "proj/sub/TICKET-1"));
        assert!(match_resource("proj/*/comments", "proj/TICKET-1/comments"));
        assert!(!match_resource("*", "a/b"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(match_resource("ticket-?", "ticket-1"));
        assert!(!match_resource("ticket-?", "ticket-12"));
        assert!(!match_resource("a?c", "a/c"));
    }

    #[test]
    fn no_substring_fallback() {
        assert!(!match_resource("TICKET", "proj/TICKET-1"));
        assert!(!match_resource("proj", "proj/TICKET-1"));
    }

    #[test]
    fn character_classes() {
        assert!(match_resource("env-[ab]", "env-a"));
        assert!(match_resource("env-[ab]", "env-b"));
        assert!(!match_resource("env-[ab]", "env-c"));
        assert!(match_resource("v[0-9]", "v7"));
        assert!(!match_resource("v[0-9]", "vx"));
        assert!(match_resource("v[^0-9]", "vx"));
        assert!(!match_resource("v[^0-9]", "v7"));
    }

    #[test]
    fn escapes() {
        assert!(match_resource(r"literal\*", "literal*"));
        assert!(!match_resource(r"literal\*", "literalx"));
        assert!(match_resource(r"a\[b", "a[b"));
    }

    #[test]
    fn malformed_patterns_match_nothing() {
        assert!(!match_resource("[unterminated", "u"));
        assert!(!match_resource(r"trailing\", "trailing"));
        assert!(!match_resource("[z-a]", "m"));
    }
}

//! Pure path normalization shared by the Mount Table Inspector and the
//! Directory Browser Sessions.
//!
//! Kept as a pure function with an exhaustive case table per the design
//! notes: no filesystem access, no symlink resolution, no `$HOME`
//! expansion — callers that need symlink resolution (the Mount Table
//! Inspector) layer it on top of this.

use once_cell::sync::Lazy;
use regex::Regex;

static BARE_DRIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z]):(/.*)?$").unwrap());
static SLASH_DRIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/([A-Za-z]):(/.*)?$").unwrap());

/// Normalize a path string to a canonical form:
/// - collapse repeated slashes
/// - canonicalize `C:/...` and `/c:/...` to `/C:/...` (uppercase drive letter,
///   always a single leading slash)
/// - strip a trailing slash, except for root (`/`) and a bare drive root
///   (`/X:/`)
///
/// `~` and `~/...` are preserved verbatim (slash-collapsed) since expanding
/// them requires the caller's home directory, which this function does not
/// have access to.
pub fn normalize(input: &str) -> String {
    let collapsed = collapse_slashes(input);

    let driveish = if let Some(caps) = BARE_DRIVE.captures(&collapsed) {
        let letter = caps.get(1).unwrap().as_str().to_ascii_uppercase();
        let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("/");
        format!("/{letter}:{rest}")
    } else if let Some(caps) = SLASH_DRIVE.captures(&collapsed) {
        let letter = caps.get(1).unwrap().as_str().to_ascii_uppercase();
        let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("/");
        format!("/{letter}:{rest}")
    } else {
        collapsed
    };

    strip_trailing_slash(&driveish)
}

fn collapse_slashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_slash = false;
    for ch in input.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(ch);
    }
    out
}

fn is_drive_root(s: &str) -> bool {
    s.len() == 4 && s.starts_with('/') && s.as_bytes()[2] == b':' && s.ends_with('/') && s.as_bytes()[1].is_ascii_alphabetic()
}

fn strip_trailing_slash(s: &str) -> String {
    if s == "/" || is_drive_root(s) {
        return s.to_string();
    }
    s.strip_suffix('/').unwrap_or(s).to_string()
}

/// Breadcrumb components produced from a normalized path, root-first.
pub fn breadcrumbs(normalized: &str) -> Vec<String> {
    normalized.split('/').filter(|c| !c.is_empty()).map(|c| c.to_string()).collect()
}

/// Normalized parent of `path`, per `go_up` semantics. Root has no parent.
pub fn parent(normalized: &str) -> Option<String> {
    if normalized == "/" || is_drive_root(normalized) {
        return None;
    }
    match normalized.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => {
            let candidate = &normalized[..idx];
            if is_drive_root(&format!("{candidate}/")) {
                Some(format!("{candidate}/"))
            } else {
                Some(candidate.to_string())
            }
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_repeated_slashes() {
        assert_eq!(normalize("/a//b///c"), "/a/b/c");
    }

    #[test]
    fn strips_trailing_slash_except_root() {
        assert_eq!(normalize("/a/b/"), "/a/b");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn canonicalizes_bare_drive_letter() {
        assert_eq!(normalize("c:/Users/x"), "/C:/Users/x");
        assert_eq!(normalize("C:/"), "/C:/");
    }

    #[test]
    fn canonicalizes_slash_prefixed_drive_letter() {
        assert_eq!(normalize("/c:/Users/x/"), "/C:/Users/x");
        assert_eq!(normalize("/D:/"), "/D:/");
    }

    #[test]
    fn preserves_tilde_forms() {
        assert_eq!(normalize("~/Documents//x"), "~/Documents/x");
        assert_eq!(normalize("~"), "~");
    }

    #[test]
    fn idempotent() {
        for p in ["/a//b/", "c:/x/", "/c:/x/", "~/a//b/", "/"] {
            let once = normalize(p);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {p}");
        }
    }

    #[test]
    fn breadcrumbs_split_on_slash() {
        assert_eq!(breadcrumbs("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(breadcrumbs("/C:/Users/x"), vec!["C:", "Users", "x"]);
    }

    #[test]
    fn parent_of_root_is_none() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/C:/"), None);
    }

    #[test]
    fn parent_computes_one_level_up() {
        assert_eq!(parent("/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(parent("/a"), Some("/".to_string()));
        assert_eq!(parent("/C:/Users/x"), Some("/C:/Users".to_string()));
    }
}

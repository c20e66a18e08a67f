//! Version grammar used by the module proxy protocol.
//!
//! A canonical version is `vMAJOR.MINOR.PATCH`, optionally followed by a
//! `-prerelease` and by the single build suffix `+incompatible`.

use std::cmp::Ordering;

/// Query sentinel asking for the newest version of a module.
pub const LATEST: &str = "latest";

/// Build suffix allowed on canonical versions of pre-module major versions.
const INCOMPATIBLE: &str = "+incompatible";

#[derive(Debug, PartialEq, Eq)]
struct Parsed<'a> {
    major: &'a str,
    minor: &'a str,
    patch: &'a str,
    prerelease: &'a str,
    build: &'a str,
}

/// Returns true if `v` is a canonical version.
pub fn is_canonical(v: &str) -> bool {
    match parse(v) {
        Some(parsed) => parsed.build.is_empty() || parsed.build == INCOMPATIBLE,
        None => false,
    }
}

/// Returns true if `v` is a pseudo-version, a version synthesised from a
/// commit timestamp and revision rather than a tag.
///
/// Accepted forms:
/// - `vX.0.0-yyyymmddhhmmss-abcdefabcdef`
/// - `vX.Y.Z-pre.0.yyyymmddhhmmss-abcdefabcdef`
/// - `vX.Y.Z-0.yyyymmddhhmmss-abcdefabcdef`
pub fn is_pseudo_version(v: &str) -> bool {
    let Some(parsed) = parse(v) else {
        return false;
    };
    let Some((base, revision)) = parsed.prerelease.rsplit_once('-') else {
        return false;
    };
    if revision.is_empty() || !revision.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }
    let is_timestamp = |s: &str| s.len() == 14 && s.bytes().all(|b| b.is_ascii_digit());
    if is_timestamp(base) {
        return parsed.minor == "0" && parsed.patch == "0";
    }
    match base.strip_prefix("0.") {
        Some(ts) if is_timestamp(ts) => true,
        _ => base
            .rsplit_once(".0.")
            .is_some_and(|(pre, ts)| !pre.is_empty() && is_timestamp(ts)),
    }
}

/// Compare two versions by semantic-version precedence.
///
/// Invalid versions order before valid ones. Versions of equal precedence
/// (for example differing only in build metadata) fall back to a byte-wise
/// comparison so that sorting is deterministic.
pub fn compare(a: &str, b: &str) -> Ordering {
    let precedence = match (parse(a), parse(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(pa), Some(pb)) => compare_numeric(pa.major, pb.major)
            .then_with(|| compare_numeric(pa.minor, pb.minor))
            .then_with(|| compare_numeric(pa.patch, pb.patch))
            .then_with(|| compare_prerelease(pa.prerelease, pb.prerelease)),
    };
    precedence.then_with(|| a.cmp(b))
}

/// Sort versions in place by ascending precedence.
pub fn sort(versions: &mut [String]) {
    versions.sort_by(|a, b| compare(a, b));
}

fn parse(v: &str) -> Option<Parsed<'_>> {
    let rest = v.strip_prefix('v')?;
    let (rest, build) = match rest.find('+') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if !build.is_empty() && !valid_identifiers(&build[1..], false) {
        return None;
    }
    let (core, prerelease) = match rest.find('-') {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, ""),
    };
    if rest.contains('-') && !valid_identifiers(prerelease, true) {
        return None;
    }
    let mut parts = core.split('.');
    let major = parts.next().filter(|p| is_number(p))?;
    let minor = parts.next().filter(|p| is_number(p))?;
    let patch = parts.next().filter(|p| is_number(p))?;
    if parts.next().is_some() {
        return None;
    }
    Some(Parsed {
        major,
        minor,
        patch,
        prerelease,
        build,
    })
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

fn valid_identifiers(s: &str, reject_leading_zero: bool) -> bool {
    !s.is_empty()
        && s.split('.').all(|id| {
            if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
                return false;
            }
            let numeric = id.bytes().all(|b| b.is_ascii_digit());
            !(reject_leading_zero && numeric && id.len() > 1 && id.starts_with('0'))
        })
}

fn compare_numeric(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_prerelease(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let x_num = x.bytes().all(|b| b.is_ascii_digit());
                let y_num = y.bytes().all(|b| b.is_ascii_digit());
                let ord = match (x_num, y_num) {
                    (true, true) => compare_numeric(x, y),
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_versions() {
        for v in ["v0.0.0", "v1.2.3", "v1.2.3-rc.1", "v2.0.0+incompatible", "v10.20.30-alpha-1"] {
            assert!(is_canonical(v), "{v} should be canonical");
        }
        for v in [
            "",
            "latest",
            "1.2.3",
            "v1",
            "v1.2",
            "v1.02.3",
            "v1.2.3-",
            "v1.2.3-01",
            "v1.2.3+meta",
            "v1.2.3.4",
            "master",
        ] {
            assert!(!is_canonical(v), "{v} should not be canonical");
        }
    }

    #[test]
    fn pseudo_versions() {
        assert!(is_pseudo_version("v0.0.0-20191109021931-daa7c04131f5"));
        assert!(is_pseudo_version("v1.2.4-0.20191109021931-daa7c04131f5"));
        assert!(is_pseudo_version("v1.2.3-pre.0.20191109021931-daa7c04131f5"));
        assert!(is_pseudo_version(
            "v2.0.0-20191109021931-daa7c04131f5+incompatible"
        ));
        assert!(!is_pseudo_version("v1.2.3"));
        assert!(!is_pseudo_version("v1.2.3-rc.1"));
        assert!(!is_pseudo_version("v1.2.0-20191109021931-daa7c04131f5"));
    }

    #[test]
    fn precedence_ordering() {
        let mut versions: Vec<String> = [
            "v1.10.0",
            "v1.2.0",
            "v1.2.0-rc.1",
            "v1.2.0-beta",
            "v1.2.0-rc.10",
            "v1.2.0-rc.2",
            "v0.9.9",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        sort(&mut versions);
        assert_eq!(
            versions,
            vec![
                "v0.9.9",
                "v1.2.0-beta",
                "v1.2.0-rc.1",
                "v1.2.0-rc.2",
                "v1.2.0-rc.10",
                "v1.2.0",
                "v1.10.0",
            ]
        );
    }

    #[test]
    fn invalid_versions_sort_first() {
        assert_eq!(compare("garbage", "v0.0.1"), Ordering::Less);
        assert_eq!(compare("v1.0.0", "v1.0.0"), Ordering::Equal);
    }
}

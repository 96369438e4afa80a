//! Validation and canonicalization of repository-relative paths.
//!
//! Every path that enters an editor or reporter call goes through this
//! module. Paths are relative to the edit (or report) anchor, use `/` as the
//! separator, and never start with `/`.

use std::borrow::Cow;

use crate::SvnError;

fn canonicalize_rel_path(path: &str, allow_empty: bool) -> Result<Cow<'_, str>, SvnError> {
    if path.starts_with('/') {
        return Err(SvnError::InvalidPath(format!(
            "'{path}' is absolute; a relative path is required"
        )));
    }

    #[cfg(windows)]
    if path.starts_with("\\\\") {
        return Err(SvnError::InvalidPath("unsafe path".into()));
    }

    if path.contains('\0') {
        return Err(SvnError::InvalidPath("unsafe path".into()));
    }

    let trimmed = path.trim_end_matches(['/', '\\']);

    if trimmed.is_empty() {
        if allow_empty {
            return Ok(Cow::Borrowed(""));
        }
        return Err(SvnError::InvalidPath("empty path".into()));
    }

    #[cfg(windows)]
    if let Some((first, rest)) = trimmed.as_bytes().split_first()
        && rest.first() == Some(&b':')
        && first.is_ascii_alphabetic()
    {
        return Err(SvnError::InvalidPath("unsafe path".into()));
    }

    let mut parts: Vec<&str> = Vec::new();
    let mut needs_alloc = trimmed.contains('\\');

    for seg in trimmed.split(['/', '\\']) {
        if seg.is_empty() || seg == "." {
            needs_alloc = true;
            continue;
        }
        if seg == ".." {
            return Err(SvnError::InvalidPath(format!(
                "'{path}' contains a '..' segment"
            )));
        }
        parts.push(seg);
    }

    if parts.is_empty() {
        if allow_empty {
            return Ok(Cow::Borrowed(""));
        }
        return Err(SvnError::InvalidPath("empty path".into()));
    }

    if !needs_alloc {
        return Ok(Cow::Borrowed(trimmed));
    }

    Ok(Cow::Owned(parts.join("/")))
}

/// Checks that `path` is a valid non-empty relative path.
pub fn validate(path: &str) -> Result<(), SvnError> {
    canonicalize_rel_path(path, false).map(|_| ())
}

/// Validates a non-empty relative path and returns its canonical form.
///
/// Redundant separators and `.` segments are collapsed; a leading `/` or any
/// `..` segment is rejected.
pub fn validate_rel_path(path: &str) -> Result<String, SvnError> {
    Ok(canonicalize_rel_path(path, false)?.into_owned())
}

/// Like [`validate_rel_path`], but accepts the empty path (the anchor itself).
pub fn validate_rel_dir_path(path: &str) -> Result<String, SvnError> {
    Ok(canonicalize_rel_path(path, true)?.into_owned())
}

pub(crate) fn validate_rel_path_ref(path: &str) -> Result<Cow<'_, str>, SvnError> {
    canonicalize_rel_path(path, false)
}

pub(crate) fn validate_rel_dir_path_ref(path: &str) -> Result<Cow<'_, str>, SvnError> {
    canonicalize_rel_path(path, true)
}

/// Joins a canonical directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Returns the parent directory of a canonical path (`""` for top-level entries).
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Returns the last component of a canonical path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Returns `true` if `path` is a direct child of `dir`.
pub fn is_child_of(dir: &str, path: &str) -> bool {
    !path.is_empty() && path != dir && dirname(path) == dir
}

/// Returns `true` if `path` equals `ancestor` or lies below it.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Returns `path` relative to `ancestor`, if `ancestor` contains it.
pub fn skip_ancestor<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    if path == ancestor {
        return Some("");
    }
    if is_ancestor(ancestor, path) {
        return Some(&path[ancestor.len() + 1..]);
    }
    None
}

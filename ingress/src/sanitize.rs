use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Reasons an ingest path component is rejected. All of these map to a 400.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathRejection {
    #[error("contains null byte")]
    NulByte,
    #[error("is empty")]
    Empty,
    #[error("contains path traversal attempt")]
    Traversal,
    #[error("contains path separator")]
    Separator,
    #[error("invalid filename")]
    Reserved,
    #[error("absolute paths not allowed")]
    Absolute,
    #[error("invalid path component")]
    BadComponent,
    #[error("path escapes base directory")]
    Escape,
}

/// Validate a bare filename: no separators, no traversal, no NUL, and it
/// must already be in canonical form.
pub fn sanitize_filename(name: &str) -> Result<String, PathRejection> {
    if name.contains('\0') {
        return Err(PathRejection::NulByte);
    }
    if name.is_empty() {
        return Err(PathRejection::Empty);
    }
    if name.contains("..") {
        return Err(PathRejection::Traversal);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PathRejection::Separator);
    }
    if name == "." {
        return Err(PathRejection::Reserved);
    }
    // A canonical filename is exactly one normal path component.
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => {}
        _ => return Err(PathRejection::Reserved),
    }
    Ok(name.to_string())
}

/// Validate a relative subdirectory path. Backslashes are normalized to
/// forward slashes; every segment must be a plain name.
pub fn sanitize_subdir(subdir: &str) -> Result<PathBuf, PathRejection> {
    if subdir.contains('\0') {
        return Err(PathRejection::NulByte);
    }
    if subdir.is_empty() {
        return Err(PathRejection::Empty);
    }

    let normalized = subdir.replace('\\', "/");
    if normalized.contains("..") {
        return Err(PathRejection::Traversal);
    }
    if normalized.starts_with('/') || Path::new(subdir).is_absolute() {
        return Err(PathRejection::Absolute);
    }

    let mut cleaned = PathBuf::new();
    for part in normalized.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(PathRejection::BadComponent);
        }
        cleaned.push(part);
    }
    if cleaned.is_absolute() {
        return Err(PathRejection::Absolute);
    }
    Ok(cleaned)
}

/// Final defense: the absolute destination must stay inside the base
/// directory once both sides are resolved to absolute, normalized form.
/// `std::path::absolute` leaves `..` components in place, so they are
/// resolved lexically here before the prefix comparison.
pub fn contained_path(base: &Path, relative: &Path) -> Result<PathBuf, PathRejection> {
    let abs_base = lexical_normalize(&std::path::absolute(base).map_err(|_| PathRejection::Escape)?);
    let abs_final = lexical_normalize(&abs_base.join(relative));
    if abs_final == abs_base || abs_final.starts_with(&abs_base) {
        Ok(abs_final)
    } else {
        Err(PathRejection::Escape)
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(std::path::MAIN_SEPARATOR_STR),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

/// The portion of a submitted filename after the last path separator.
/// Browsers and some clients submit full client-side paths.
pub fn submitted_basename(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw)
}

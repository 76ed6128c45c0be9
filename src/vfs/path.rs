//! POSIX path helpers for the virtual filesystem.
//!
//! All paths inside a [`Volume`](super::Volume) are absolute. Relative
//! inputs are interpreted against `/`.

/// Collapse `.`, `..` and repeated separators into an absolute path.
///
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(&parts.join("/"));
    out
}

/// Join `rel` onto the directory `base`. Absolute `rel` replaces `base`.
pub fn join(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        normalize(rel)
    } else {
        normalize(&format!("{base}/{rel}"))
    }
}

/// Split a normalized path into its components.
pub fn components(path: &str) -> Vec<String> {
    normalize(path)
        .split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parent directory of a path (`/` for top-level entries and for `/` itself).
pub fn dirname(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// Last component of a path, empty for `/`.
pub fn basename(path: &str) -> String {
    let normalized = normalize(path);
    normalized
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// File extension without the dot, if any.
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let idx = name.rfind('.')?;
    if idx == 0 {
        return None;
    }
    Some(&name[idx + 1..])
}

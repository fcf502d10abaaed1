//! Lexical path handling. Nothing here touches real storage.

/// Collapse `.`, `..` and repeated separators without consulting the
/// filesystem. `..` at the top of an absolute path stays at `/`; leading
/// `..` segments of a relative path are kept. An empty result is `.`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".into(),
        (false, false) => joined,
    }
}

/// Join `path` onto `base` unless it is already absolute.
pub fn join(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if base.ends_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Split a normalized path into (parent, final segment).
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// True if `path` equals `root` or lies beneath it, after normalizing both.
/// Compared segment-wise so `/alice2` is not inside `/alice`.
pub fn is_contained(root: &str, path: &str) -> bool {
    with_trailing_sep(normalize(path)).starts_with(&with_trailing_sep(normalize(root)))
}

fn with_trailing_sep(mut path: String) -> String {
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

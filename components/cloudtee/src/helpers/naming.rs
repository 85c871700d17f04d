//! Derivation of object keys and log stream names from the output name.

/// Object key for `output_name` under `prefix_path`.
///
/// A prefix ending in `/` is a directory and is joined with path semantics
/// (`.`/`..` resolved, repeated separators collapsed). Any other prefix is a
/// plain string prefix. Leading separators are stripped from the result.
pub fn object_key(prefix_path: &str, output_name: &str) -> String {
    let key = if prefix_path.ends_with('/') {
        join_clean(prefix_path, output_name)
    } else {
        format!("{prefix_path}{output_name}")
    };
    key.trim_start_matches('/').to_string()
}

/// Log stream name for `output_name`: extension dropped, leading separators
/// trimmed and the remaining separators flattened to `-`.
pub fn log_stream_name(output_name: &str) -> String {
    let stem = &output_name[..output_name.len() - extension(output_name).len()];
    stem.trim_start_matches('/').replace('/', "-")
}

/// Suffix starting at the last `.` of the final path element, or `""`.
fn extension(path: &str) -> &str {
    for (idx, ch) in path.char_indices().rev() {
        match ch {
            '/' => return "",
            '.' => return &path[idx..],
            _ => {}
        }
    }
    ""
}

fn join_clean(dir: &str, name: &str) -> String {
    let joined = if name.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{name}")
    };
    clean(&joined)
}

/// Lexical path normalisation.
fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let body = parts.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

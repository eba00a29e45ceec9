use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};

/// Rewrite both `/` and `\` to the host separator and drop empty segments,
/// keeping a leading root.
pub fn normalize_separators(raw: &str) -> String {
    let unified: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect();
    let rooted = unified.starts_with(MAIN_SEPARATOR);
    let joined = unified
        .split(MAIN_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(&MAIN_SEPARATOR.to_string());
    if rooted {
        format!("{MAIN_SEPARATOR}{joined}")
    } else {
        joined
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return lexical_clean(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => lexical_clean(&cwd.join(path)),
        Err(_) => lexical_clean(path),
    }
}

fn root_of(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        .collect()
}

/// Back-reference text for `target` as seen from a ledger stored at `ledger`:
/// relative to the ledger's directory when both live under the same root or
/// volume, otherwise absolute. Always uses `/` like spreadsheet hyperlinks.
pub fn link_target(ledger: &Path, target: &Path) -> String {
    let ledger = absolutize(ledger);
    let target = absolutize(target);
    let base = ledger.parent().map(Path::to_path_buf).unwrap_or_default();

    if root_of(&base) != root_of(&target) {
        return to_link_text(&target);
    }

    let base_parts: Vec<_> = base.components().collect();
    let target_parts: Vec<_> = target.components().collect();
    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part.as_os_str());
    }
    to_link_text(&rel)
}

fn to_link_text(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Resolve a back-reference read from the ledger to a filesystem path.
pub fn resolve_link(ledger: &Path, link: &str) -> PathBuf {
    let candidate = PathBuf::from(normalize_separators(link));
    if candidate.is_absolute() {
        return candidate;
    }
    let base = absolutize(ledger)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    lexical_clean(&base.join(candidate))
}

//! Helpers for POSIX-like remote paths ("/Docs/A.txt", folders end with '/').

pub const SEPARATOR: char = '/';
pub const ROOT_PATH: &str = "/";

pub fn is_folder_path(remote_path: &str) -> bool {
    remote_path.ends_with(SEPARATOR)
}

/// Appends the separator if missing.
pub fn folder_path(remote_path: &str) -> String {
    if is_folder_path(remote_path) {
        remote_path.to_string()
    } else {
        format!("{remote_path}{SEPARATOR}")
    }
}

/// Last path segment, without the trailing separator of folders.
pub fn file_name(remote_path: &str) -> &str {
    let trimmed = remote_path.trim_end_matches(SEPARATOR);
    trimmed
        .rsplit_once(SEPARATOR)
        .map(|(_, name)| name)
        .unwrap_or(trimmed)
}

/// Parent folder path (always ending with '/'), `None` for the root.
pub fn parent_path(remote_path: &str) -> Option<String> {
    let trimmed = remote_path.trim_end_matches(SEPARATOR);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rsplit_once(SEPARATOR) {
        Some((parent, _)) => Some(folder_path(parent)),
        None => Some(ROOT_PATH.to_string()),
    }
}

pub fn child_path(folder: &str, name: &str, is_folder: bool) -> String {
    let joined = format!("{}{}", folder_path(folder), name);
    if is_folder { folder_path(&joined) } else { joined }
}

/// Path the object would have after being renamed to `new_name` in place.
pub fn renamed_path(remote_path: &str, new_name: &str) -> String {
    let is_folder = is_folder_path(remote_path);
    let parent = parent_path(remote_path).unwrap_or_else(|| ROOT_PATH.to_string());
    child_path(&parent, new_name, is_folder)
}

/// True when `candidate` is `ancestor` itself or lives below it.
pub fn is_same_or_descendant(candidate: &str, ancestor: &str) -> bool {
    if is_folder_path(ancestor) {
        candidate.starts_with(ancestor)
    } else {
        candidate == ancestor
    }
}

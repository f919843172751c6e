use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("account name is empty")]
    EmptyOwner,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

/// Local location for `remote_path` of `owner`: `<root>/<owner>/<path>`.
pub fn save_path_for(root: &Path, owner: &str, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }
    if owner.is_empty() {
        return Err(PathError::EmptyOwner);
    }

    let mut out = root.join(encode_owner(owner));
    // Remote paths are POSIX-like ("/Docs/A.txt"); map them under the account dir.
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Percent-encodes everything except alphanumerics and `@._-`.
fn encode_owner(owner: &str) -> String {
    let mut out = String::with_capacity(owner.len());
    for byte in owner.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'@' | b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

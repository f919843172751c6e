use std::collections::HashSet;

use sqlx::SqliteConnection;
use tracing::{debug, warn};

use super::index::{self, IndexError, ROOT_PARENT_ID};

/// Sets or clears the conflict marker of a file and carries the change up
/// the tree.
///
/// A set climbs unconditionally to the top-most folder. A clear climbs only
/// while the parent has no other conflicted child.
pub async fn update_conflict(
    conn: &mut SqliteConnection,
    file_id: i64,
    etag_in_conflict: Option<&str>,
) -> Result<(), IndexError> {
    let mut visited = HashSet::new();
    let mut current = file_id;
    loop {
        if !visited.insert(current) {
            warn!(id = current, "cycle while propagating conflict marker");
            return Ok(());
        }
        index::set_etag_in_conflict(conn, current, etag_in_conflict).await?;

        let Some(record) = index::file_by_id(conn, current).await? else {
            return Ok(());
        };
        if record.parent_id == ROOT_PARENT_ID {
            return Ok(());
        }
        if etag_in_conflict.is_none() {
            let siblings = index::folder_content(conn, record.parent_id).await?;
            if siblings.iter().any(|f| f.etag_in_conflict.is_some()) {
                debug!(parent = record.parent_id, "parent keeps conflict marker");
                return Ok(());
            }
        }
        current = record.parent_id;
    }
}

pub async fn set_conflict(
    conn: &mut SqliteConnection,
    file_id: i64,
    etag_in_conflict: &str,
) -> Result<(), IndexError> {
    update_conflict(conn, file_id, Some(etag_in_conflict)).await
}

pub async fn clear_conflict(conn: &mut SqliteConnection, file_id: i64) -> Result<(), IndexError> {
    update_conflict(conn, file_id, None).await
}

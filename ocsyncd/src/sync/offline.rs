use sqlx::SqliteConnection;
use tracing::info;

use super::engine::{EngineError, SyncEngine};
use super::index::{self, AvailableOfflineStatus, FileRecord, IndexError, ROOT_PARENT_ID};

/// Status of a file placed under a folder with status `parent`, given the
/// file's own previous status.
pub fn inherited_status(
    parent: AvailableOfflineStatus,
    own: AvailableOfflineStatus,
) -> AvailableOfflineStatus {
    if parent.is_available() {
        AvailableOfflineStatus::AvailableAsParent
    } else if own == AvailableOfflineStatus::Available {
        AvailableOfflineStatus::Available
    } else {
        AvailableOfflineStatus::NotAvailable
    }
}

/// Writes `status` on the record and overrides every descendant of a folder.
pub async fn apply_offline_status(
    conn: &mut SqliteConnection,
    record: &FileRecord,
    status: AvailableOfflineStatus,
) -> Result<(), IndexError> {
    index::set_offline_status(conn, record.id, status).await?;
    if !record.is_folder() {
        return Ok(());
    }
    let descendant_status = if status.is_available() {
        AvailableOfflineStatus::AvailableAsParent
    } else {
        AvailableOfflineStatus::NotAvailable
    };
    for descendant in index::subtree(conn, record).await?.into_iter().skip(1) {
        index::set_offline_status(conn, descendant.id, descendant_status).await?;
    }
    Ok(())
}

impl SyncEngine {
    /// Marks a file or folder as (not) available offline. Only explicit
    /// statuses are accepted. Unmarking inside an available folder falls back
    /// to the status inherited from that folder.
    pub async fn set_available_offline_status(
        &self,
        file_id: i64,
        status: AvailableOfflineStatus,
    ) -> Result<(), EngineError> {
        if status == AvailableOfflineStatus::AvailableAsParent {
            return Err(EngineError::InvalidOperation(
                "available-as-parent is derived and cannot be set".into(),
            ));
        }
        let mut tx = self.index.begin().await?;
        let Some(record) = index::file_by_id(&mut tx, file_id).await? else {
            return Err(EngineError::NotFound(format!("file id {file_id}")));
        };
        let parent_available = record.parent_id != ROOT_PARENT_ID
            && index::file_by_id(&mut tx, record.parent_id)
                .await?
                .is_some_and(|parent| parent.is_available_offline());
        let status = if parent_available && status == AvailableOfflineStatus::NotAvailable {
            AvailableOfflineStatus::AvailableAsParent
        } else {
            status
        };
        apply_offline_status(&mut tx, &record, status).await?;
        tx.commit().await?;
        info!(path = %record.remote_path, ?status, "available offline status updated");
        Ok(())
    }
}

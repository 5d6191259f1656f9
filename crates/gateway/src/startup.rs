//! Startup task loading

use secretary_shared::{RemoteTask, Storage};

use crate::error::GatewayResult;

/// Every active task of every active secretary.
///
/// A secretary whose task records cannot be read is skipped with an error
/// log; only failing to enumerate secretaries at all is fatal.
pub async fn load_active_tasks(storage: &dyn Storage) -> GatewayResult<Vec<RemoteTask>> {
    let mut tasks = Vec::new();

    for info in storage.list_secretary_infos().await? {
        if !info.active {
            tracing::debug!(secretary = %info.name, "Skipping inactive secretary");
            continue;
        }

        let secretary_tasks = match storage.list_tasks(&info.id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(secretary = %info.name, error = %e, "Failed to load tasks");
                continue;
            }
        };

        for mut task in secretary_tasks {
            if !task.is_active() {
                tracing::debug!(secretary = %info.name, task = %task.display_name(), status = ?task.status, "Skipping task");
                continue;
            }
            if task.secretary_name.trim().is_empty() {
                task.secretary_name = info.name.clone();
            }
            tasks.push(task);
        }
    }

    tracing::info!(count = tasks.len(), "Loaded active tasks");
    Ok(tasks)
}

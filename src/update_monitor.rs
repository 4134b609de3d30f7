//! Update Monitor (C4): a single filesystem watch over the shared image
//! directory.
//!
//! Recognized events: close-write/moved-to become *updated*, delete/moved-
//! from become *deleted*; anything not ending in `.png`/`.desc` is ignored.
//! Overflow is surfaced to callbacks as a flag rather than silently
//! dropped. Dispatch snapshots the callback list before iterating so a
//! callback that mutates the list (by unregistering itself or another
//! entry) can never invalidate the iteration — the tombstone dance in the
//! original implementation existed only to work around exactly that, and a
//! snapshot sidesteps it entirely (DESIGN NOTES §9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Updated { filename: String },
    Deleted { filename: String },
    Overflow,
}

/// Returns `false` to have the entry removed after this dispatch — either
/// because the callback reports failure or because it no longer wants
/// further events (spec.md §4.4).
pub type MonitorCallback = Arc<dyn Fn(&FsEvent) -> bool + Send + Sync>;

struct Registration {
    id: u64,
    callback: MonitorCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_filename: HashMap<String, Vec<Registration>>,
}

impl Registry {
    fn register(&mut self, filename: &str, callback: MonitorCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_filename.entry(filename.to_string()).or_default().push(Registration { id, callback });
        id
    }

    /// Detaches immediately, returning whether an entry was found. There is
    /// no in-use/tombstone distinction here because dispatch always works
    /// off a snapshot, so a concurrent unregister during dispatch is safe.
    fn unregister(&mut self, filename: &str, id: u64) -> bool {
        if let Some(list) = self.by_filename.get_mut(filename) {
            let before = list.len();
            list.retain(|r| r.id != id);
            if list.is_empty() {
                self.by_filename.remove(filename);
            }
            return list.len() != before;
        }
        false
    }
}

impl Clone for Registration {
    fn clone(&self) -> Self {
        Self { id: self.id, callback: self.callback.clone() }
    }
}

pub struct UpdateMonitor {
    update_registry: Mutex<Registry>,
    delete_registry: Mutex<Registry>,
    overflowed: Mutex<bool>,
}

impl UpdateMonitor {
    pub fn new() -> Self {
        Self {
            update_registry: Mutex::new(Registry::default()),
            delete_registry: Mutex::new(Registry::default()),
            overflowed: Mutex::new(false),
        }
    }

    pub async fn on_updated(&self, filename: &str, callback: MonitorCallback) -> u64 {
        self.update_registry.lock().await.register(filename, callback)
    }

    pub async fn on_deleted(&self, filename: &str, callback: MonitorCallback) -> u64 {
        self.delete_registry.lock().await.register(filename, callback)
    }

    pub async fn remove_updated(&self, filename: &str, id: u64) -> bool {
        self.update_registry.lock().await.unregister(filename, id)
    }

    pub async fn remove_deleted(&self, filename: &str, id: u64) -> bool {
        self.delete_registry.lock().await.unregister(filename, id)
    }

    pub async fn has_overflowed(&self) -> bool {
        *self.overflowed.lock().await
    }

    /// Feeds one filesystem event through the relevant registry, snapshot-
    /// then-iterate, removing any entry whose callback returned `false`.
    pub async fn dispatch(&self, event: FsEvent) {
        match &event {
            FsEvent::Overflow => {
                *self.overflowed.lock().await = true;
                return;
            }
            FsEvent::Updated { filename } => self.dispatch_one(&self.update_registry, filename, &event).await,
            FsEvent::Deleted { filename } => self.dispatch_one(&self.delete_registry, filename, &event).await,
        }
    }

    async fn dispatch_one(&self, registry: &Mutex<Registry>, filename: &str, event: &FsEvent) {
        let snapshot: Vec<Registration> = {
            let guard = registry.lock().await;
            guard.by_filename.get(filename).cloned().unwrap_or_default()
        };

        let mut to_remove = Vec::new();
        for registration in &snapshot {
            if !(registration.callback)(event) {
                to_remove.push(registration.id);
            }
        }

        if !to_remove.is_empty() {
            let mut guard = registry.lock().await;
            if let Some(list) = guard.by_filename.get_mut(filename) {
                list.retain(|r| !to_remove.contains(&r.id));
                if list.is_empty() {
                    guard.by_filename.remove(filename);
                }
            }
        }
    }
}

impl Default for UpdateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn recognized_filename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(".png") || name.ends_with(".desc") {
        Some(name.to_string())
    } else {
        None
    }
}

/// Spawns a background task translating raw filesystem notifications from
/// `dir` into [`FsEvent`]s delivered over the returned channel. The
/// `RecommendedWatcher` is returned too, so the caller controls its
/// lifetime (dropping it stops the watch).
pub fn watch_directory(dir: PathBuf) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<FsEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(_) => {
                let _ = tx.send(FsEvent::Overflow);
                return;
            }
        };

        use notify::EventKind;
        let mapped = match event.kind {
            EventKind::Create(_) | EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::To)) => {
                event.paths.first().and_then(|p| recognized_filename(p)).map(|filename| FsEvent::Updated { filename })
            }
            EventKind::Remove(_) => {
                event.paths.first().and_then(|p| recognized_filename(p)).map(|filename| FsEvent::Deleted { filename })
            }
            _ => None,
        };

        if let Some(mapped) = mapped {
            let _ = tx.send(mapped);
        }
    })
    .map_err(|e| crate::error::WidgetError::Fault(format!("failed to start watcher: {e}")))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::error::WidgetError::Fault(format!("failed to watch {}: {e}", dir.display())))?;

    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatch_invokes_registered_callback() {
        let monitor = UpdateMonitor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        monitor
            .on_updated("w1.png", Arc::new(move |_e| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                true
            }))
            .await;

        monitor.dispatch(FsEvent::Updated { filename: "w1.png".into() }).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_returning_false_is_removed_after_dispatch() {
        let monitor = UpdateMonitor::new();
        let id = monitor.on_updated("w1.png", Arc::new(|_e| false)).await;
        monitor.dispatch(FsEvent::Updated { filename: "w1.png".into() }).await;
        // already removed by the dispatch itself; a second removal attempt finds nothing
        assert!(!monitor.remove_updated("w1.png", id).await);
    }

    #[tokio::test]
    async fn one_failing_sibling_does_not_remove_the_other() {
        let monitor = UpdateMonitor::new();
        let id_a = monitor.on_updated("w1.png", Arc::new(|_e| false)).await;
        let id_b = monitor.on_updated("w1.png", Arc::new(|_e| true)).await;

        monitor.dispatch(FsEvent::Updated { filename: "w1.png".into() }).await;

        assert!(!monitor.remove_updated("w1.png", id_a).await);
        assert!(monitor.remove_updated("w1.png", id_b).await);
    }

    #[tokio::test]
    async fn overflow_event_sets_flag() {
        let monitor = UpdateMonitor::new();
        assert!(!monitor.has_overflowed().await);
        monitor.dispatch(FsEvent::Overflow).await;
        assert!(monitor.has_overflowed().await);
    }

    #[tokio::test]
    async fn non_matching_filename_is_ignored_by_watcher_mapping() {
        assert_eq!(recognized_filename(Path::new("/tmp/foo.txt")), None);
        assert_eq!(recognized_filename(Path::new("/tmp/foo.png")), Some("foo.png".to_string()));
        assert_eq!(recognized_filename(Path::new("/tmp/foo.desc")), Some("foo.desc".to_string()));
    }
}

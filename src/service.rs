//! Async host service
//!
//! Runs the blocking [`ContentManager`] on tokio's blocking pool and
//! broadcasts lifecycle events to any number of subscribers.
//!
//! ```text
//! caller ──► ContentService ──spawn_blocking──► ContentManager
//!                 │
//!                 └─► broadcast::Sender<ContentEvent> ──► subscribers
//! ```

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{ContentError, Result};
use crate::item::ContentItem;
use crate::manager::{ContentManager, GcReport};
use crate::progress::ProgressListener;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ContentEvent {
    LocalListReady(Arc<Vec<ContentItem>>),
    RemoteListReady(Arc<Vec<ContentItem>>),
    DownloadProgress {
        name: String,
        current: u64,
        max: u64,
    },
    DownloadFinished {
        remote: ContentItem,
        local: ContentItem,
    },
    DownloadInterrupted {
        name: String,
    },
    DownloadFailed {
        name: String,
        error: String,
    },
}

/// A download running on the blocking pool
pub struct DownloadHandle {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<ContentItem>>,
}

impl DownloadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Abort at the next read of the download stream
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<ContentItem> {
        self.join.await.map_err(join_error)?
    }
}

pub struct ContentService {
    manager: Arc<ContentManager>,
    events: broadcast::Sender<ContentEvent>,
    downloads: Mutex<CancellationToken>,
}

impl ContentService {
    pub fn new(manager: Arc<ContentManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            manager,
            events,
            downloads: Mutex::new(CancellationToken::new()),
        }
    }

    /// Open the manager described by `config` on the blocking pool
    pub async fn start(config: Config) -> Result<Self> {
        let manager = tokio::task::spawn_blocking(move || ContentManager::open(config))
            .await
            .map_err(join_error)??;
        Ok(Self::new(Arc::new(manager)))
    }

    pub fn manager(&self) -> &Arc<ContentManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.events.subscribe()
    }

    /// Start downloading `item`. Progress and the outcome arrive as events.
    pub fn download(&self, item: ContentItem) -> DownloadHandle {
        let name = item.name.clone();
        let cancel = self.downloads.lock().child_token();

        let listener: ProgressListener = {
            let events = self.events.clone();
            let name = name.clone();
            Arc::new(move |current, max| {
                let _ = events.send(ContentEvent::DownloadProgress {
                    name: name.clone(),
                    current,
                    max,
                });
            })
        };

        let manager = self.manager.clone();
        let events = self.events.clone();
        let token = cancel.clone();
        let join = tokio::task::spawn_blocking(move || {
            let result = manager.download_content_item(&item, Some(listener), token);
            let event = match &result {
                Ok(local) => ContentEvent::DownloadFinished {
                    remote: item.clone(),
                    local: local.clone(),
                },
                Err(ContentError::Cancelled) => ContentEvent::DownloadInterrupted {
                    name: item.name.clone(),
                },
                Err(e) => ContentEvent::DownloadFailed {
                    name: item.name.clone(),
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
            if result.is_ok() {
                let _ = events.send(ContentEvent::LocalListReady(manager.local_items()));
            }
            result
        });

        debug!(name = %name, "Download scheduled");
        DownloadHandle { name, cancel, join }
    }

    /// Cancel every download started so far
    pub fn interrupt_downloads(&self) {
        let mut downloads = self.downloads.lock();
        downloads.cancel();
        *downloads = CancellationToken::new();
        info!("Interrupted all downloads");
    }

    pub async fn refresh_local(&self) -> Result<Arc<Vec<ContentItem>>> {
        let items = self.blocking(|m| m.refresh_local_items()).await?;
        let _ = self.events.send(ContentEvent::LocalListReady(items.clone()));
        Ok(items)
    }

    /// Refresh the remote list from `roots`, or from the configured catalog
    /// roots when `None`
    pub async fn refresh_remote(&self, roots: Option<Vec<String>>) -> Result<Arc<Vec<ContentItem>>> {
        let items = self
            .blocking(move |m| {
                let roots = roots.unwrap_or_else(|| m.config().catalog_urls.clone());
                m.refresh_remote_content_list(&roots)
            })
            .await?;
        let _ = self.events.send(ContentEvent::RemoteListReady(items.clone()));
        Ok(items)
    }

    pub async fn delete(&self, item: ContentItem) -> Result<bool> {
        let deleted = self.blocking(move |m| Ok(m.delete_content_item(&item))).await?;
        self.announce_local();
        Ok(deleted)
    }

    /// Unpack (if needed) and activate a stored item
    pub async fn unpack_and_activate(&self, item: ContentItem) -> Result<Option<PathBuf>> {
        self.blocking(move |m| {
            m.unpack_content_item(&item)?;
            m.activate_content_item(&item)
        })
        .await
    }

    pub async fn garbage_collect(&self) -> Result<GcReport> {
        let report = self.blocking(|m| m.garbage_collect()).await?;
        self.announce_local();
        Ok(report)
    }

    pub async fn migrate(&self, new_root: PathBuf) -> Result<()> {
        self.blocking(move |m| m.migrate(&new_root)).await?;
        self.announce_local();
        Ok(())
    }

    fn announce_local(&self) {
        let _ = self
            .events
            .send(ContentEvent::LocalListReady(self.manager.local_items()));
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ContentManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> ContentError {
    ContentError::Io(std::io::Error::other(e))
}

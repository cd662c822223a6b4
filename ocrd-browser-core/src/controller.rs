use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

use crate::catalog::PageCatalog;
use crate::config::FileGroups;
use crate::document::{Document, DocumentError};
use crate::store::{
    ActiveStore, ImageDecoder, LazyImageStore, RowLoader, SharedStore, StoreError,
};
use crate::PreviewImage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSelected {
    pub page_id: String,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&PageSelected) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-only access to the controller's store, holding its lock.
pub struct StoreView<'a>(MutexGuard<'a, LazyImageStore>);

impl Deref for StoreView<'_> {
    type Target = LazyImageStore;

    fn deref(&self) -> &LazyImageStore {
        &self.0
    }
}

/// Drives a [`LazyImageStore`] for the bound document and tracks the selected page.
pub struct PreviewListController {
    file_groups: FileGroups,
    decoder: Arc<dyn ImageDecoder>,
    placeholder: Arc<PreviewImage>,
    store: SharedStore,
    active: ActiveStore,
    current_index: Option<usize>,
    current_page_id: Option<String>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl PreviewListController {
    pub fn new(
        file_groups: FileGroups,
        decoder: Arc<dyn ImageDecoder>,
        placeholder: Arc<PreviewImage>,
    ) -> Self {
        let store = LazyImageStore::create(
            Vec::new(),
            Arc::clone(&decoder),
            Arc::clone(&placeholder),
        )
        .expect("an empty store has no duplicate page ids");
        let active = ActiveStore::default();
        active.set(store.generation());
        Self {
            file_groups,
            decoder,
            placeholder,
            store: Arc::new(Mutex::new(store)),
            active,
            current_index: None,
            current_page_id: None,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Replaces the store with fresh placeholder rows for `document` and clears the
    /// selection. Loaders handed out for the previous store turn into no-ops.
    #[instrument(skip_all, fields(document = %document.id()))]
    pub fn bind(&mut self, document: &Document) -> Result<(), BindError> {
        let images = PageCatalog::resolve_preferred(document, &self.file_groups)?;
        let missing = document.page_ids().len().saturating_sub(images.len());
        if missing > 0 {
            info!(missing, "pages without a preview image");
        }
        let store = LazyImageStore::create(
            images.rows(),
            Arc::clone(&self.decoder),
            Arc::clone(&self.placeholder),
        )?;
        debug!(rows = store.len(), generation = %store.generation(), "bound new store");

        self.active.set(store.generation());
        self.store = Arc::new(Mutex::new(store));
        self.current_index = None;
        self.current_page_id = None;
        Ok(())
    }

    pub fn start_loading(&self) -> RowLoader {
        LazyImageStore::start_loading(&self.store, &self.active)
    }

    pub fn store(&self) -> StoreView<'_> {
        StoreView(self.store.lock())
    }

    /// Resets rows whose file changed or failed to load, and hands out a loader for
    /// them when there are any.
    pub fn refresh_stale(&mut self) -> (usize, Option<RowLoader>) {
        let stale = self.store.lock().invalidate_stale();
        info!(stale, "refreshing previews");
        let loader = (stale > 0).then(|| self.start_loading());
        (stale, loader)
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_page_id(&self) -> Option<&str> {
        self.current_page_id.as_deref()
    }

    pub fn select(&mut self, index: usize) {
        let page_id = {
            let store = self.store.lock();
            match store.at(index) {
                Some(row) => row.page_id().to_string(),
                None => return,
            }
        };
        self.current_index = Some(index);
        if self.current_page_id.as_deref() == Some(page_id.as_str()) {
            return;
        }
        self.current_page_id = Some(page_id.clone());
        let event = PageSelected { page_id, index };
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    /// Negative indices count from the end, `-1` being the last page.
    pub fn goto_index(&mut self, index: isize) {
        let len = self.len() as isize;
        let resolved = if index < 0 { len + index } else { index };
        if (0..len).contains(&resolved) {
            self.select(resolved as usize);
        }
    }

    pub fn goto_first(&mut self) {
        self.select(0);
    }

    pub fn goto_last(&mut self) {
        if let Some(last) = self.len().checked_sub(1) {
            self.select(last);
        }
    }

    /// Moves `delta` rows from the current one, clamping at either end. Does nothing
    /// while no page is selected.
    pub fn skip(&mut self, delta: isize) {
        let Some(current) = self.current_index else {
            return;
        };
        let steps = delta.unsigned_abs().saturating_sub(1);
        let target = {
            let store = self.store.lock();
            match delta.signum() {
                -1 => store.previous(current.saturating_sub(steps)),
                1 => store.next(current.saturating_add(steps)),
                _ => current,
            }
        };
        self.select(target);
    }

    pub fn select_page(&mut self, page_id: &str) {
        let index = self.store.lock().index_of(page_id);
        if let Some(index) = index {
            self.select(index);
        }
    }

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&PageSelected) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(known, _)| *known != id);
        self.listeners.len() != before
    }
}

//! Page preview rows whose thumbnails are decoded after the store is created.
//!
//! A [`LazyImageStore`] starts out with one placeholder row per page. A [`RowLoader`]
//! then realizes the rows one at a time, in row order, yielding to the caller's event
//! loop between rows. Each realized row remembers a [`ContentHash`] of its backing
//! file so that changed files can be detected and reloaded later.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{PreviewImage, THUMBNAIL_WIDTH};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page id {0:?} appears more than once")]
    DuplicatePageId(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read file: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported or corrupt image: {0}")]
    Format(String),
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub original_width: u32,
    pub original_height: u32,
    pub thumbnail: PreviewImage,
}

/// Decodes an image file and scales it to `target_width`, keeping the aspect ratio.
pub trait ImageDecoder: Send + Sync {
    fn decode_scaled(&self, path: &Path, target_width: u32) -> Result<DecodedImage, DecodeError>;
}

/// Staleness fingerprint of a file: its path plus modification time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn compute(path: &Path) -> Result<Self, DecodeError> {
        let modified = fs::metadata(path)?.modified()?;
        let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
        Ok(Self(format!(
            "{}:{}.{:09}",
            path.display(),
            since_epoch.as_secs(),
            since_epoch.subsec_nanos()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Thumbnail {
    Placeholder(Arc<PreviewImage>),
    Decoded(Arc<PreviewImage>),
}

impl Thumbnail {
    pub fn image(&self) -> &PreviewImage {
        match self {
            Thumbnail::Placeholder(image) | Thumbnail::Decoded(image) => image,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Thumbnail::Placeholder(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Pending,
    Realized,
    Failed,
}

/// One row of the store. Only the store mutates rows.
#[derive(Debug, Clone)]
pub struct PageRecord {
    page_id: String,
    label: String,
    source_path: PathBuf,
    thumbnail: Thumbnail,
    content_hash: Option<ContentHash>,
    state: RowState,
}

impl PageRecord {
    fn placeholder(page_id: String, source_path: PathBuf, image: Arc<PreviewImage>) -> Self {
        Self {
            label: loading_label(&source_path),
            page_id,
            source_path,
            thumbnail: Thumbnail::Placeholder(image),
            content_hash: None,
            state: RowState::Pending,
        }
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn thumbnail(&self) -> &Thumbnail {
        &self.thumbnail
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    fn reset(&mut self, placeholder: &Arc<PreviewImage>) {
        self.label = loading_label(&self.source_path);
        self.thumbnail = Thumbnail::Placeholder(Arc::clone(placeholder));
        self.content_hash = None;
        self.state = RowState::Pending;
    }
}

fn loading_label(path: &Path) -> String {
    format!("Loading {}", path.display())
}

pub type SharedStore = Arc<Mutex<LazyImageStore>>;

/// Generation of the store its owner currently considers active.
#[derive(Debug, Clone, Default)]
pub struct ActiveStore(Arc<Mutex<Option<Uuid>>>);

impl ActiveStore {
    pub fn set(&self, generation: Uuid) {
        *self.0.lock() = Some(generation);
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    pub fn is(&self, generation: Uuid) -> bool {
        *self.0.lock() == Some(generation)
    }
}

pub struct LazyImageStore {
    generation: Uuid,
    rows: Vec<PageRecord>,
    positions: HashMap<String, usize>,
    placeholder: Arc<PreviewImage>,
    decoder: Arc<dyn ImageDecoder>,
}

impl fmt::Debug for LazyImageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyImageStore")
            .field("generation", &self.generation)
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl LazyImageStore {
    pub fn create<I>(
        rows: I,
        decoder: Arc<dyn ImageDecoder>,
        placeholder: Arc<PreviewImage>,
    ) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = (String, PathBuf)>,
    {
        let mut records = Vec::new();
        let mut positions = HashMap::new();
        for (page_id, source_path) in rows {
            if positions.insert(page_id.clone(), records.len()).is_some() {
                return Err(StoreError::DuplicatePageId(page_id));
            }
            records.push(PageRecord::placeholder(
                page_id,
                source_path,
                Arc::clone(&placeholder),
            ));
        }
        Ok(Self {
            generation: Uuid::new_v4(),
            rows: records,
            positions,
            placeholder,
            decoder,
        })
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&PageRecord> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> &[PageRecord] {
        &self.rows
    }

    pub fn index_of(&self, page_id: &str) -> Option<usize> {
        self.positions.get(page_id).copied()
    }

    pub fn next(&self, index: usize) -> usize {
        let last = self.rows.len().saturating_sub(1);
        index.saturating_add(1).min(last)
    }

    pub fn previous(&self, index: usize) -> usize {
        let last = self.rows.len().saturating_sub(1);
        index.min(last).saturating_sub(1)
    }

    pub fn pending_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| row.state == RowState::Pending)
            .count()
    }

    fn next_pending_from(&self, start: usize) -> Option<usize> {
        (start..self.rows.len()).find(|&index| self.rows[index].state == RowState::Pending)
    }

    /// Hands out a loader that realizes every pending row of `store`, one per step.
    pub fn start_loading(store: &SharedStore, active: &ActiveStore) -> RowLoader {
        let generation = store.lock().generation;
        RowLoader {
            store: Arc::downgrade(store),
            generation,
            active: active.clone(),
            cursor: 0,
        }
    }

    /// Decodes the row's image and refreshes its label, thumbnail and hash.
    ///
    /// Returns `None` when `index` is out of range.
    #[instrument(skip(self), fields(generation = %self.generation))]
    pub fn realize(&mut self, index: usize) -> Option<RowState> {
        let decoder = Arc::clone(&self.decoder);
        let placeholder = Arc::clone(&self.placeholder);
        let row = self.rows.get_mut(index)?;

        let outcome = ContentHash::compute(&row.source_path).and_then(|hash| {
            decoder
                .decode_scaled(&row.source_path, THUMBNAIL_WIDTH)
                .map(|decoded| (hash, decoded))
        });

        match outcome {
            Ok((hash, decoded)) => {
                if row.content_hash.as_ref() == Some(&hash) {
                    debug!(page_id = %row.page_id, "backing file unchanged");
                }
                row.label = format!(
                    "{} ({}x{})",
                    row.source_path.display(),
                    decoded.original_width,
                    decoded.original_height
                );
                row.thumbnail = Thumbnail::Decoded(Arc::new(decoded.thumbnail));
                row.content_hash = Some(hash);
                row.state = RowState::Realized;
            }
            Err(err) => {
                warn!(page_id = %row.page_id, path = %row.source_path.display(), %err, "failed to realize preview");
                row.label = format!("Error loading {}: {}", row.source_path.display(), err);
                row.thumbnail = Thumbnail::Placeholder(placeholder);
                row.content_hash = None;
                row.state = RowState::Failed;
            }
        }
        Some(row.state)
    }

    /// Rows whose backing file no longer matches the hash taken at realization, plus
    /// rows that failed to load.
    pub fn stale_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| match row.state {
                RowState::Pending => false,
                RowState::Failed => true,
                RowState::Realized => {
                    ContentHash::compute(&row.source_path).ok().as_ref() != row.content_hash.as_ref()
                }
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Puts stale rows back to the placeholder state so the next loading pass redoes them.
    pub fn invalidate_stale(&mut self) -> usize {
        let stale = self.stale_rows();
        for &index in &stale {
            self.rows[index].reset(&self.placeholder);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "invalidated stale previews");
        }
        stale.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStep {
    Realized { index: usize, page_id: String },
    Failed { index: usize, page_id: String },
    Finished,
    /// The store was replaced or dropped; nothing was touched.
    Abandoned,
}

/// Realizes the pending rows of one store, one row per [`RowLoader::step`].
#[derive(Debug)]
pub struct RowLoader {
    store: Weak<Mutex<LazyImageStore>>,
    generation: Uuid,
    active: ActiveStore,
    cursor: usize,
}

impl RowLoader {
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn step(&mut self) -> LoadStep {
        if !self.active.is(self.generation) {
            return LoadStep::Abandoned;
        }
        let Some(store) = self.store.upgrade() else {
            return LoadStep::Abandoned;
        };
        let mut store = store.lock();
        let Some(index) = store.next_pending_from(self.cursor) else {
            return LoadStep::Finished;
        };
        self.cursor = index + 1;
        let page_id = store.rows[index].page_id.clone();
        match store.realize(index) {
            Some(RowState::Failed) => LoadStep::Failed { index, page_id },
            _ => LoadStep::Realized { index, page_id },
        }
    }

    /// Runs to completion, yielding to the runtime between rows.
    pub async fn run(mut self) -> LoadStep {
        loop {
            match self.step() {
                step @ (LoadStep::Finished | LoadStep::Abandoned) => return step,
                _ => tokio::task::yield_now().await,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    use tempfile::{tempdir, TempDir};

    /// Reads `<width>x<height>` from the file instead of decoding pixels.
    #[derive(Default)]
    pub(crate) struct FakeDecoder {
        pub(crate) calls: AtomicUsize,
    }

    impl ImageDecoder for FakeDecoder {
        fn decode_scaled(&self, path: &Path, target_width: u32) -> Result<DecodedImage, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = fs::read_to_string(path)?;
            let (w, h) = text
                .trim()
                .split_once('x')
                .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
                .ok_or_else(|| DecodeError::Format(text.clone()))?;
            let height = (h * target_width / w.max(1)).max(1);
            Ok(DecodedImage {
                original_width: w,
                original_height: h,
                thumbnail: PreviewImage {
                    width: target_width,
                    height,
                    pixels: vec![0; (target_width * height * 4) as usize],
                },
            })
        }
    }

    pub(crate) fn write_pages(pages: &[(&str, &str)]) -> (TempDir, Vec<(String, PathBuf)>) {
        let dir = tempdir().unwrap();
        let rows = pages
            .iter()
            .map(|(page_id, content)| {
                let path = dir.path().join(format!("{page_id}.png"));
                fs::write(&path, content).unwrap();
                (page_id.to_string(), path)
            })
            .collect();
        (dir, rows)
    }

    pub(crate) fn placeholder() -> Arc<PreviewImage> {
        Arc::new(PreviewImage::placeholder(48, [128, 128, 128, 255]))
    }

    fn store_for(rows: Vec<(String, PathBuf)>) -> (SharedStore, ActiveStore, Arc<FakeDecoder>) {
        let decoder = Arc::new(FakeDecoder::default());
        let store = LazyImageStore::create(rows, decoder.clone(), placeholder()).unwrap();
        let active = ActiveStore::default();
        active.set(store.generation());
        (Arc::new(Mutex::new(store)), active, decoder)
    }

    #[test]
    fn fresh_rows_are_placeholders_in_any_read_order() {
        let (_dir, rows) = write_pages(&[("P1", "200x300"), ("P2", "200x300"), ("P3", "200x300")]);
        let store = LazyImageStore::create(rows, Arc::new(FakeDecoder::default()), placeholder())
            .unwrap();

        for index in [2, 0, 1, 2] {
            let row = store.at(index).unwrap();
            assert!(row.thumbnail().is_placeholder());
            assert!(row.label().starts_with("Loading "));
            assert!(row.content_hash().is_none());
            assert_eq!(row.state(), RowState::Pending);
        }
        assert_eq!(store.pending_count(), 3);
    }

    #[test]
    fn duplicate_page_ids_are_rejected() {
        let rows = vec![
            ("P1".to_string(), PathBuf::from("/a.png")),
            ("P1".to_string(), PathBuf::from("/b.png")),
        ];
        let result = LazyImageStore::create(rows, Arc::new(FakeDecoder::default()), placeholder());
        assert!(matches!(result, Err(StoreError::DuplicatePageId(id)) if id == "P1"));
    }

    #[test]
    fn navigation_clamps_at_both_ends() {
        let rows = (1..=3)
            .map(|n| (format!("P{n}"), PathBuf::from(format!("/{n}.png"))))
            .collect::<Vec<_>>();
        let store = LazyImageStore::create(rows, Arc::new(FakeDecoder::default()), placeholder())
            .unwrap();

        assert_eq!(store.next(0), 1);
        assert_eq!(store.next(2), 2);
        assert_eq!(store.previous(0), 0);
        assert_eq!(store.previous(2), 1);
        assert_eq!(store.index_of("P3"), Some(2));
        assert_eq!(store.index_of("P9"), None);
    }

    #[test]
    fn empty_store_navigation_stays_at_zero() {
        let store = LazyImageStore::create(
            Vec::<(String, PathBuf)>::new(),
            Arc::new(FakeDecoder::default()),
            placeholder(),
        )
        .unwrap();
        assert_eq!(store.next(0), 0);
        assert_eq!(store.previous(0), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn realize_sets_label_thumbnail_and_hash() {
        let (_dir, rows) = write_pages(&[("P1", "400x800")]);
        let path = rows[0].1.clone();
        let mut store = LazyImageStore::create(rows, Arc::new(FakeDecoder::default()), placeholder())
            .unwrap();

        assert_eq!(store.realize(0), Some(RowState::Realized));
        let row = store.at(0).unwrap();
        assert_eq!(row.label(), format!("{} (400x800)", path.display()));
        assert!(!row.thumbnail().is_placeholder());
        assert_eq!(row.thumbnail().image().width, THUMBNAIL_WIDTH);
        assert_eq!(row.thumbnail().image().height, 200);
        assert_eq!(row.content_hash(), Some(&ContentHash::compute(&path).unwrap()));
        assert_eq!(store.realize(7), None);
    }

    #[test]
    fn realizing_unchanged_file_keeps_hash_and_still_decodes() {
        let (_dir, rows) = write_pages(&[("P1", "10x10")]);
        let decoder = Arc::new(FakeDecoder::default());
        let mut store = LazyImageStore::create(rows, decoder.clone(), placeholder()).unwrap();

        store.realize(0);
        let first = store.at(0).unwrap().content_hash().cloned();
        store.realize(0);
        let second = store.at(0).unwrap().content_hash().cloned();

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn loader_realizes_rows_in_order_and_survives_failures() {
        let (_dir, rows) = write_pages(&[("P1", "10x10"), ("P2", "10x10"), ("P3", "10x20")]);
        fs::remove_file(&rows[1].1).unwrap();
        let (store, active, _decoder) = store_for(rows);

        let mut loader = LazyImageStore::start_loading(&store, &active);
        assert_eq!(
            loader.step(),
            LoadStep::Realized {
                index: 0,
                page_id: "P1".into()
            }
        );
        assert_eq!(
            loader.step(),
            LoadStep::Failed {
                index: 1,
                page_id: "P2".into()
            }
        );
        assert_eq!(
            loader.step(),
            LoadStep::Realized {
                index: 2,
                page_id: "P3".into()
            }
        );
        assert_eq!(loader.step(), LoadStep::Finished);

        let store = store.lock();
        let failed = store.at(1).unwrap();
        assert_eq!(failed.state(), RowState::Failed);
        assert!(failed.label().starts_with("Error loading "));
        assert!(failed.thumbnail().is_placeholder());
        assert!(failed.content_hash().is_none());
        assert!(store.at(2).unwrap().label().ends_with("(10x20)"));
    }

    #[test]
    fn corrupt_file_marks_row_failed() {
        let (_dir, rows) = write_pages(&[("P1", "not an image")]);
        let mut store = LazyImageStore::create(rows, Arc::new(FakeDecoder::default()), placeholder())
            .unwrap();
        assert_eq!(store.realize(0), Some(RowState::Failed));
        assert!(store.at(0).unwrap().label().contains("unsupported or corrupt image"));
    }

    #[tokio::test]
    async fn run_completes_every_row() {
        let (_dir, rows) = write_pages(&[("P1", "10x10"), ("P2", "20x10"), ("P3", "30x10")]);
        let paths: Vec<PathBuf> = rows.iter().map(|(_, path)| path.clone()).collect();
        let (store, active, _decoder) = store_for(rows);

        let loader = LazyImageStore::start_loading(&store, &active);
        assert_eq!(loader.run().await, LoadStep::Finished);

        let store = store.lock();
        assert_eq!(store.pending_count(), 0);
        for (row, path) in store.rows().iter().zip(&paths) {
            assert_eq!(row.state(), RowState::Realized);
            assert_eq!(row.content_hash(), Some(&ContentHash::compute(path).unwrap()));
        }
    }

    #[test]
    fn loader_is_abandoned_when_store_is_no_longer_active() {
        let (_dir, rows) = write_pages(&[("P1", "10x10"), ("P2", "10x10")]);
        let (store, active, decoder) = store_for(rows);

        let mut loader = LazyImageStore::start_loading(&store, &active);
        active.set(Uuid::new_v4());

        assert_eq!(loader.step(), LoadStep::Abandoned);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.lock().pending_count(), 2);
    }

    #[test]
    fn loader_is_abandoned_when_store_is_dropped() {
        let (_dir, rows) = write_pages(&[("P1", "10x10")]);
        let (store, active, _decoder) = store_for(rows);

        let mut loader = LazyImageStore::start_loading(&store, &active);
        drop(store);
        assert_eq!(loader.step(), LoadStep::Abandoned);
    }

    #[test]
    fn modified_files_are_invalidated_and_reloaded() {
        let (_dir, rows) = write_pages(&[("P1", "10x10"), ("P2", "10x10")]);
        let changed = rows[1].1.clone();
        let (store, active, decoder) = store_for(rows);
        let mut first_pass = LazyImageStore::start_loading(&store, &active);
        assert_eq!(
            first_pass.step(),
            LoadStep::Realized {
                index: 0,
                page_id: "P1".into()
            }
        );
        drop(first_pass);
        let mut loader = LazyImageStore::start_loading(&store, &active);
        while loader.step() != LoadStep::Finished {}
        assert!(store.lock().stale_rows().is_empty());

        fs::write(&changed, "20x10").unwrap();
        let file = fs::File::options().write(true).open(&changed).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.lock().stale_rows(), vec![1]);
        assert_eq!(store.lock().invalidate_stale(), 1);
        {
            let store = store.lock();
            assert!(store.at(1).unwrap().thumbnail().is_placeholder());
            assert_eq!(store.at(0).unwrap().state(), RowState::Realized);
        }

        let calls_before = decoder.calls.load(Ordering::SeqCst);
        let mut loader = LazyImageStore::start_loading(&store, &active);
        assert_eq!(
            loader.step(),
            LoadStep::Realized {
                index: 1,
                page_id: "P2".into()
            }
        );
        assert_eq!(loader.step(), LoadStep::Finished);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), calls_before + 1);
        assert!(store.lock().at(1).unwrap().label().ends_with("(20x10)"));
    }
}

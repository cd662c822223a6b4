use std::path::Path;

use once_cell::sync::Lazy;
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod controller;
pub mod document;
pub mod launcher;
pub mod store;
pub mod window;

pub use catalog::{PageCatalog, PageImage, PageImages};
pub use config::{ConfigError, FileGroups, RejectedTool, Settings, Tool};
pub use controller::{BindError, PageSelected, PreviewListController, StoreView, SubscriptionId};
pub use document::{Document, DocumentError, MetadataIndex, Mets, OcrdFile};
pub use launcher::{LaunchError, Launcher, TemplateFields};
pub use store::{
    ActiveStore, ContentHash, DecodeError, DecodedImage, ImageDecoder, LazyImageStore, LoadStep,
    PageRecord, RowLoader, RowState, SharedStore, StoreError, Thumbnail,
};
pub use window::{ActionState, BrowserWindow, View};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0a6c52-8d1e-5b7a-9c44-0e2d71b8a913").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

/// Width every preview thumbnail is scaled down to.
pub const THUMBNAIL_WIDTH: u32 = 100;

/// RGBA8 pixel buffer, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PreviewImage {
    /// Solid square used while a row has not been realized yet.
    pub fn placeholder(size: u32, rgba: [u8; 4]) -> Self {
        let size = size.max(1);
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take((size * size * 4) as usize)
            .collect();
        Self {
            width: size,
            height: size,
            pixels,
        }
    }
}

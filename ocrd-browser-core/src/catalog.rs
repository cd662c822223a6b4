use std::collections::HashMap;
use std::path::PathBuf;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::FileGroups;
use crate::document::{Document, DocumentError, OcrdFile};

pub const DEFAULT_FILE_GROUP: &str = "OCR-D-IMG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page_id: String,
    pub path: PathBuf,
    pub file: OcrdFile,
}

/// Page images in the document's canonical page order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageImages {
    entries: Vec<PageImage>,
}

impl PageImages {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageImage> {
        self.entries.iter()
    }

    pub fn get(&self, page_id: &str) -> Option<&PageImage> {
        self.entries.iter().find(|entry| entry.page_id == page_id)
    }

    pub fn page_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.page_id.as_str())
    }

    /// `(page_id, path)` pairs, the shape `LazyImageStore::create` takes.
    pub fn rows(&self) -> Vec<(String, PathBuf)> {
        self.entries
            .iter()
            .map(|entry| (entry.page_id.clone(), entry.path.clone()))
            .collect()
    }
}

/// Stateless projection from a document's metadata to one image per page.
pub struct PageCatalog;

impl PageCatalog {
    pub fn resolve(document: &Document, file_group: &str) -> Result<PageImages, DocumentError> {
        let by_page = Self::files_by_page(document, file_group)?;
        let entries = document
            .page_ids()
            .iter()
            .filter_map(|page_id| by_page.get(page_id).cloned())
            .collect();
        Ok(PageImages { entries })
    }

    /// Like [`PageCatalog::resolve`], but picks per page the first group matching the
    /// configured preference list.
    pub fn resolve_preferred(
        document: &Document,
        groups: &FileGroups,
    ) -> Result<PageImages, DocumentError> {
        let candidates = Self::candidate_groups(document, groups);
        debug!(?candidates, "resolving preferred image groups");

        let mut lookups = Vec::with_capacity(candidates.len());
        for group in &candidates {
            lookups.push(Self::files_by_page(document, group)?);
        }

        let entries = document
            .page_ids()
            .iter()
            .filter_map(|page_id| lookups.iter().find_map(|lookup| lookup.get(page_id)).cloned())
            .collect();
        Ok(PageImages { entries })
    }

    /// The file [`PageCatalog::resolve_preferred`] would pick for `page_id`, looking only
    /// at the files that page points at.
    pub fn file_for_page(
        document: &Document,
        page_id: &str,
        groups: &FileGroups,
    ) -> Result<Option<OcrdFile>, DocumentError> {
        let files = document.index().files_for_page(page_id)?;
        if files.is_empty() {
            return Ok(None);
        }
        let picked = Self::candidate_groups(document, groups)
            .iter()
            .find_map(|group| files.iter().find(|file| &file.file_grp == group))
            .cloned();
        Ok(picked)
    }

    fn files_by_page(
        document: &Document,
        file_group: &str,
    ) -> Result<HashMap<String, PageImage>, DocumentError> {
        let index = document.index();
        let files = index.find_files(file_group)?;
        let ids: Vec<String> = files.iter().map(|file| file.id.clone()).collect();
        let pages = index.physical_pages_for(&ids)?;

        let mut by_page = HashMap::with_capacity(files.len());
        for (file, page_id) in files.into_iter().zip(pages) {
            let Some(page_id) = page_id else {
                continue;
            };
            by_page.entry(page_id.clone()).or_insert_with(|| PageImage {
                page_id,
                path: document.path(&file.local_filename),
                file,
            });
        }
        Ok(by_page)
    }

    fn candidate_groups(document: &Document, groups: &FileGroups) -> Vec<String> {
        let available = document.index().file_groups();
        let mut ordered: Vec<String> = Vec::new();
        for pattern in &groups.preferred_images {
            let matcher = group_matcher(pattern);
            for group in &available {
                if matcher.is_match(group) && !ordered.contains(group) {
                    ordered.push(group.clone());
                }
            }
        }
        ordered
    }
}

fn group_matcher(pattern: &str) -> Regex {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(regex) => regex,
        Err(err) => {
            warn!(%pattern, %err, "invalid file group pattern, matching literally");
            Regex::new(&format!("^{}$", regex::escape(pattern)))
                .expect("escaped pattern is a valid regex")
        }
    }
}

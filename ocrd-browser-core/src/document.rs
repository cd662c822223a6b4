use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{document_id_for_path, DocumentId};

const METS_FILE_NAME: &str = "mets.xml";
const XLINK_NS: &str = "http://www.w3.org/1999/xlink";
const IDENTIFIER_PRIORITY: [&str; 4] = ["purl", "urn", "handle", "url"];
const IN_MEMORY: &str = "<memory>";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse METS {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("file id {0:?} is not part of the METS file section")]
    UnknownFileId(String),
}

/// One `mets:file` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OcrdFile {
    pub id: String,
    pub file_grp: String,
    pub mimetype: Option<String>,
    pub page_id: Option<String>,
    /// `mets:FLocat/@xlink:href`, usually relative to the workspace directory.
    pub local_filename: String,
}

/// Read-only view on a document's metadata.
pub trait MetadataIndex: fmt::Debug + Send + Sync {
    fn unique_identifier(&self) -> Option<&str>;

    /// Physical page ids in canonical order.
    fn page_ids(&self) -> Vec<String>;

    fn file_groups(&self) -> Vec<String>;

    fn find_files(&self, file_group: &str) -> Result<Vec<OcrdFile>, DocumentError>;

    /// Files the page's `mets:fptr` entries point at, in document order.
    fn files_for_page(&self, page_id: &str) -> Result<Vec<OcrdFile>, DocumentError>;

    /// Maps each file id to the physical page that references it, `None` when no page does.
    fn physical_pages_for(&self, file_ids: &[String]) -> Result<Vec<Option<String>>, DocumentError>;
}

#[derive(Debug, Clone)]
struct PhysicalPage {
    id: String,
    file_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Mets {
    identifier: Option<String>,
    groups: Vec<String>,
    files: Vec<OcrdFile>,
    pages: Vec<PhysicalPage>,
    file_positions: HashMap<String, usize>,
    page_positions: HashMap<String, usize>,
}

impl Mets {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> Result<Self, DocumentError> {
        let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mets = Self::parse(&text).map_err(|err| match err {
            DocumentError::Parse { message, .. } => DocumentError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        debug!(
            pages = mets.pages.len(),
            files = mets.files.len(),
            "parsed METS"
        );
        Ok(mets)
    }

    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let doc = roxmltree::Document::parse(text).map_err(|err| parse_error(err.to_string()))?;
        let mut mets = Mets::default();
        let mut identifiers: Vec<(Option<String>, String)> = Vec::new();

        for node in doc.descendants().filter(|node| node.is_element()) {
            match node.tag_name().name() {
                "identifier" => {
                    if let Some(text) = node.text().map(str::trim).filter(|t| !t.is_empty()) {
                        let kind = node.attribute("type").map(str::to_string);
                        identifiers.push((kind, text.to_string()));
                    }
                }
                "fileGrp" => {
                    let Some(group) = node.attribute("USE") else {
                        continue;
                    };
                    if !mets.groups.iter().any(|g| g == group) {
                        mets.groups.push(group.to_string());
                    }
                    for file in node
                        .children()
                        .filter(|child| child.is_element() && child.tag_name().name() == "file")
                    {
                        let Some(id) = file.attribute("ID") else {
                            return Err(parse_error(format!("mets:file in group {group} without ID")));
                        };
                        let href = file
                            .children()
                            .find(|child| child.tag_name().name() == "FLocat")
                            .and_then(|flocat| flocat.attribute((XLINK_NS, "href")))
                            .unwrap_or_default();
                        mets.files.push(OcrdFile {
                            id: id.to_string(),
                            file_grp: group.to_string(),
                            mimetype: file.attribute("MIMETYPE").map(str::to_string),
                            page_id: None,
                            local_filename: href.to_string(),
                        });
                    }
                }
                "structMap" if node.attribute("TYPE") == Some("PHYSICAL") => {
                    for div in node.descendants().filter(|child| {
                        child.tag_name().name() == "div" && child.attribute("TYPE") == Some("page")
                    }) {
                        let Some(id) = div.attribute("ID") else {
                            continue;
                        };
                        let file_ids = div
                            .children()
                            .filter(|child| child.tag_name().name() == "fptr")
                            .filter_map(|fptr| fptr.attribute("FILEID"))
                            .map(str::to_string)
                            .collect();
                        mets.pages.push(PhysicalPage {
                            id: id.to_string(),
                            file_ids,
                        });
                    }
                }
                _ => {}
            }
        }

        mets.identifier = IDENTIFIER_PRIORITY
            .iter()
            .find_map(|wanted| {
                identifiers
                    .iter()
                    .find(|(kind, _)| kind.as_deref() == Some(*wanted))
                    .map(|(_, value)| value.clone())
            });

        for (position, file) in mets.files.iter().enumerate() {
            mets.file_positions.entry(file.id.clone()).or_insert(position);
        }
        for (position, page) in mets.pages.iter().enumerate() {
            mets.page_positions.entry(page.id.clone()).or_insert(position);
            for file_id in &page.file_ids {
                if let Some(&file) = mets.file_positions.get(file_id) {
                    mets.files[file].page_id.get_or_insert_with(|| page.id.clone());
                }
            }
        }

        Ok(mets)
    }
}

impl MetadataIndex for Mets {
    fn unique_identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    fn page_ids(&self) -> Vec<String> {
        self.pages.iter().map(|page| page.id.clone()).collect()
    }

    fn file_groups(&self) -> Vec<String> {
        self.groups.clone()
    }

    fn find_files(&self, file_group: &str) -> Result<Vec<OcrdFile>, DocumentError> {
        Ok(self
            .files
            .iter()
            .filter(|file| file.file_grp == file_group)
            .cloned()
            .collect())
    }

    fn files_for_page(&self, page_id: &str) -> Result<Vec<OcrdFile>, DocumentError> {
        let Some(&page) = self.page_positions.get(page_id) else {
            return Ok(Vec::new());
        };
        self.pages[page]
            .file_ids
            .iter()
            .map(|file_id| {
                self.file_positions
                    .get(file_id)
                    .map(|&file| self.files[file].clone())
                    .ok_or_else(|| DocumentError::UnknownFileId(file_id.clone()))
            })
            .collect()
    }

    fn physical_pages_for(&self, file_ids: &[String]) -> Result<Vec<Option<String>>, DocumentError> {
        file_ids
            .iter()
            .map(|file_id| {
                self.file_positions
                    .get(file_id)
                    .map(|&file| self.files[file].page_id.clone())
                    .ok_or_else(|| DocumentError::UnknownFileId(file_id.clone()))
            })
            .collect()
    }
}

fn parse_error(message: String) -> DocumentError {
    DocumentError::Parse {
        path: PathBuf::from(IN_MEMORY),
        message,
    }
}

/// An opened workspace: a METS index plus the directory its files are relative to.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    directory: PathBuf,
    mets_target: String,
    index: Arc<dyn MetadataIndex>,
    page_ids: Vec<String>,
}

impl Document {
    /// Document shown before anything has been opened.
    pub fn empty() -> Self {
        let directory = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::from_index(directory, METS_FILE_NAME, Arc::new(Mets::default()))
    }

    /// Opens `path`, which is either a METS file or a workspace directory containing `mets.xml`.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let mets_path = if path.is_dir() {
            path.join(METS_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        let mets_path = mets_path
            .canonicalize()
            .map_err(|source| DocumentError::Io {
                path: mets_path.clone(),
                source,
            })?;
        let index = Mets::from_file(&mets_path)?;
        let directory = mets_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let mets_target = mets_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| METS_FILE_NAME.to_string());
        Ok(Self::from_index(directory, &mets_target, Arc::new(index)))
    }

    pub fn from_index(
        directory: impl Into<PathBuf>,
        mets_target: &str,
        index: Arc<dyn MetadataIndex>,
    ) -> Self {
        let directory = directory.into();
        let page_ids = index.page_ids();
        Self {
            id: document_id_for_path(&directory.join(mets_target)),
            directory,
            mets_target: mets_target.to_string(),
            index,
            page_ids,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn mets_target(&self) -> &str {
        &self.mets_target
    }

    pub fn page_ids(&self) -> &[String] {
        &self.page_ids
    }

    pub fn page_position(&self, page_id: &str) -> Option<usize> {
        self.page_ids.iter().position(|id| id == page_id)
    }

    pub fn index(&self) -> &dyn MetadataIndex {
        self.index.as_ref()
    }

    pub fn unique_identifier(&self) -> Option<&str> {
        self.index.unique_identifier()
    }

    /// Resolves a file reference from the METS against the workspace directory.
    pub fn path(&self, href: &str) -> PathBuf {
        let href = href.strip_prefix("file://").unwrap_or(href);
        let candidate = Path::new(href);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.directory.join(candidate)
        }
    }
}

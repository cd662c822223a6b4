use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::config::{Settings, Tool};
use crate::document::{Document, OcrdFile};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unknown placeholder {{{0}}} in commandline")]
    UnknownPlaceholder(String),
    #[error("unbalanced braces in commandline {0:?}")]
    UnbalancedBraces(String),
    #[error("value of {field} cannot be shell-quoted")]
    Unquotable { field: &'static str },
    #[error("failed to spawn tool {tool:?}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
}

fn quote(field: &'static str, value: &str) -> Result<String, LaunchError> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| LaunchError::Unquotable { field })
}

/// Shell-quoted values a commandline template may refer to.
#[derive(Debug, Clone)]
pub struct TemplateFields {
    file_id: String,
    file_mimetype: String,
    file_grp: String,
    file_page_id: String,
    file_url: String,
    file_absolute: String,
    file_relative: String,
    workspace_directory: String,
    workspace_mets_target: String,
    workspace_identifier: String,
}

impl TemplateFields {
    pub fn new(document: &Document, file: &OcrdFile) -> Result<Self, LaunchError> {
        let absolute = absolute_path(&document.path(&file.local_filename));
        Ok(Self {
            file_id: quote("file.ID", &file.id)?,
            file_mimetype: quote("file.mimetype", file.mimetype.as_deref().unwrap_or_default())?,
            file_grp: quote("file.fileGrp", &file.file_grp)?,
            file_page_id: quote("file.pageId", file.page_id.as_deref().unwrap_or_default())?,
            file_url: quote("file.url", &file.local_filename)?,
            file_absolute: quote("file.path.absolute", &absolute.to_string_lossy())?,
            file_relative: quote("file.path.relative", &file.local_filename)?,
            workspace_directory: quote(
                "workspace.directory",
                &document.directory().to_string_lossy(),
            )?,
            workspace_mets_target: quote("workspace.mets_target", document.mets_target())?,
            workspace_identifier: quote(
                "workspace.unique_identifier",
                document.unique_identifier().unwrap_or_default(),
            )?,
        })
    }

    fn lookup(&self, field: &str) -> Option<&str> {
        let value = match field {
            "file.ID" | "file.id" => &self.file_id,
            "file.mimetype" => &self.file_mimetype,
            "file.fileGrp" => &self.file_grp,
            "file.pageId" => &self.file_page_id,
            "file.url" => &self.file_url,
            "file.path"
            | "file.path.absolute"
            | "file.local_filename"
            | "file.local_filename.absolute" => &self.file_absolute,
            "file.path.relative" | "file.local_filename.relative" => &self.file_relative,
            "workspace.directory" => &self.workspace_directory,
            "workspace.mets_target" => &self.workspace_mets_target,
            "workspace.unique_identifier" => &self.workspace_identifier,
            _ => return None,
        };
        Some(value.as_str())
    }

    /// Replaces every `{field}` of `template`; `{{` and `}}` stand for literal braces.
    pub fn render(&self, template: &str) -> Result<String, LaunchError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => field.push(ch),
                            None => return Err(LaunchError::UnbalancedBraces(template.to_string())),
                        }
                    }
                    let value = self
                        .lookup(field.trim())
                        .ok_or_else(|| LaunchError::UnknownPlaceholder(field.clone()))?;
                    out.push_str(value);
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '}' => return Err(LaunchError::UnbalancedBraces(template.to_string())),
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Starts configured external tools on a document's files.
#[derive(Debug, Clone, Default)]
pub struct Launcher {
    tools: Vec<Tool>,
}

impl Launcher {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self { tools }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.tools.clone())
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Launches `tool_name` on `file`. An unknown tool is logged together with a config
    /// snippet that would define it, and nothing is spawned.
    pub fn launch(
        &self,
        tool_name: &str,
        document: &Document,
        file: &OcrdFile,
    ) -> Result<Option<Child>, LaunchError> {
        match self.tools.iter().find(|tool| tool.name == tool_name) {
            Some(tool) => self.launch_tool(tool, document, file).map(Some),
            None => {
                error!(
                    "Tool \"{}\" not found in your config, to fix place the following section in your {}",
                    tool_name,
                    crate::config::CONFIG_FILE_NAME
                );
                error!("[Tool {}]", tool_name);
                error!("commandline = /usr/bin/yourtool --base-dir {{workspace.directory}} {{file.path.absolute}}");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, fields(tool = %tool.name, file = %file.id))]
    pub fn launch_tool(
        &self,
        tool: &Tool,
        document: &Document,
        file: &OcrdFile,
    ) -> Result<Child, LaunchError> {
        let commandline = TemplateFields::new(document, file)?.render(&tool.commandline)?;
        debug!(%commandline, "calling tool");
        Command::new("sh")
            .arg("-c")
            .arg(&commandline)
            .current_dir(document.directory())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                tool: tool.name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::SAMPLE_METS;
    use crate::document::{MetadataIndex, Mets};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn document_in(dir: &Path) -> Document {
        Document::from_index(dir, "mets.xml", Arc::new(Mets::parse(SAMPLE_METS).unwrap()))
    }

    fn first_image(document: &Document) -> OcrdFile {
        document.index().find_files("OCR-D-IMG").unwrap().remove(0)
    }

    #[test]
    fn renders_quoted_fields() {
        let dir = tempdir().unwrap();
        let workspace = dir.path().join("my workspace");
        std::fs::create_dir(&workspace).unwrap();
        let doc = document_in(&workspace);
        let file = first_image(&doc);

        let fields = TemplateFields::new(&doc, &file).unwrap();
        let rendered = fields
            .render("viewer --base-dir {workspace.directory} {file.path.absolute} --id {file.ID}")
            .unwrap();

        let words = shlex::split(&rendered).unwrap();
        assert_eq!(
            words,
            vec![
                "viewer".to_string(),
                "--base-dir".to_string(),
                workspace.display().to_string(),
                workspace.join("OCR-D-IMG/1.png").display().to_string(),
                "--id".to_string(),
                "IMG_1".to_string(),
            ]
        );
    }

    #[test]
    fn relative_and_page_fields() {
        let doc = document_in(Path::new("/data/ws"));
        let file = first_image(&doc);
        let fields = TemplateFields::new(&doc, &file).unwrap();

        assert_eq!(
            fields
                .render("{file.path.relative} {file.pageId} {file.fileGrp} {workspace.mets_target}")
                .unwrap(),
            "OCR-D-IMG/1.png PHYS_0001 OCR-D-IMG mets.xml"
        );
        assert_eq!(fields.render("{file.path}").unwrap(), "/data/ws/OCR-D-IMG/1.png");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let doc = document_in(Path::new("/data/ws"));
        let fields = TemplateFields::new(&doc, &first_image(&doc)).unwrap();
        assert_eq!(
            fields.render("awk '{{print}}' {file.ID}").unwrap(),
            "awk '{print}' IMG_1"
        );
    }

    #[test]
    fn unknown_and_unbalanced_placeholders_fail() {
        let doc = document_in(Path::new("/data/ws"));
        let fields = TemplateFields::new(&doc, &first_image(&doc)).unwrap();

        assert!(matches!(
            fields.render("tool {file.nope}"),
            Err(LaunchError::UnknownPlaceholder(field)) if field == "file.nope"
        ));
        assert!(matches!(
            fields.render("tool {file.ID"),
            Err(LaunchError::UnbalancedBraces(_))
        ));
        assert!(matches!(
            fields.render("tool }"),
            Err(LaunchError::UnbalancedBraces(_))
        ));
    }

    #[test]
    fn unknown_tool_spawns_nothing() {
        let doc = document_in(Path::new("/data/ws"));
        let launcher = Launcher::default();
        let child = launcher.launch("Missing", &doc, &first_image(&doc)).unwrap();
        assert!(child.is_none());
    }

    #[test]
    fn launch_runs_in_workspace_directory() {
        let dir = tempdir().unwrap();
        let doc = document_in(dir.path());
        let tool = Tool::new("Touch", "touch {file.pageId}.launched", None).unwrap();
        let launcher = Launcher::new(vec![tool]);

        let mut child = launcher
            .launch("Touch", &doc, &first_image(&doc))
            .unwrap()
            .expect("tool is configured");
        assert!(child.wait().unwrap().success());
        assert!(dir.path().join("PHYS_0001.launched").exists());
    }
}

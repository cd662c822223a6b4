use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use ocrd_browser_core::{
    Document, Launcher, PageCatalog, PageRecord, PreviewListController, RowState, Settings,
    Thumbnail,
};
use ocrd_browser_render::{loading_placeholder, FileImageDecoder};
use serde::Serialize;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

mod browse;

#[derive(Debug, Parser)]
#[command(
    name = "ocrd-browser",
    version,
    about = "Browse the page images of an OCR-D workspace"
)]
struct Args {
    /// Config file to read instead of the default search path (repeatable)
    #[arg(long = "config", global = true, value_name = "FILE")]
    config: Vec<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Page through a workspace interactively
    View {
        /// Workspace directory or METS file
        workspace: PathBuf,

        /// Physical page to select first
        #[arg(short = 'p', long = "page")]
        page: Option<String>,
    },
    /// Load every page preview and print one row per page
    Pages {
        workspace: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// List configured tools
    Tools,
    /// Run a configured tool on the image of one page
    Launch {
        workspace: PathBuf,

        #[arg(short = 't', long = "tool")]
        tool: String,

        #[arg(short = 'p', long = "page")]
        page: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "ocr-d", "ocrd-browser")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let interactive = matches!(args.action, Action::View { .. });
    let _log_guard = init_logging(&project_dirs, !interactive)?;
    let settings = load_settings(&args.config)?;

    match args.action {
        Action::View { workspace, page } => {
            browse::run(&settings, &workspace, page.as_deref()).await
        }
        Action::Pages { workspace, json } => print_pages(&settings, &workspace, json).await,
        Action::Tools => print_tools(&settings),
        Action::Launch {
            workspace,
            tool,
            page,
        } => launch(&settings, &workspace, &tool, &page),
    }
}

fn load_settings(explicit: &[PathBuf]) -> Result<Settings> {
    if explicit.is_empty() {
        return Settings::build_default().context("failed to read configuration");
    }
    if let Some(missing) = explicit.iter().find(|path| !path.is_file()) {
        bail!("config file {} does not exist", missing.display());
    }
    Settings::build_from_files(explicit).context("failed to read configuration")
}

fn open_document(workspace: &Path) -> Result<Document> {
    let document = Document::load(workspace)
        .with_context(|| format!("failed to open workspace {}", workspace.display()))?;
    info!(
        directory = %document.directory().display(),
        pages = document.page_ids().len(),
        "opened workspace"
    );
    Ok(document)
}

fn new_controller(settings: &Settings) -> PreviewListController {
    PreviewListController::new(
        settings.file_groups.clone(),
        Arc::new(FileImageDecoder::new()),
        loading_placeholder(),
    )
}

#[derive(Debug, Serialize)]
struct PageRow<'a> {
    page_id: &'a str,
    path: &'a Path,
    label: &'a str,
    state: &'static str,
    content_hash: Option<&'a str>,
    thumbnail: Option<[u32; 2]>,
}

impl<'a> From<&'a PageRecord> for PageRow<'a> {
    fn from(record: &'a PageRecord) -> Self {
        let thumbnail = match record.thumbnail() {
            Thumbnail::Decoded(image) => Some([image.width, image.height]),
            Thumbnail::Placeholder(_) => None,
        };
        Self {
            page_id: record.page_id(),
            path: record.source_path(),
            label: record.label(),
            state: state_name(record.state()),
            content_hash: record.content_hash().map(|hash| hash.as_str()),
            thumbnail,
        }
    }
}

fn state_name(state: RowState) -> &'static str {
    match state {
        RowState::Pending => "pending",
        RowState::Realized => "realized",
        RowState::Failed => "failed",
    }
}

async fn print_pages(settings: &Settings, workspace: &Path, json: bool) -> Result<()> {
    let document = open_document(workspace)?;
    let mut controller = new_controller(settings);
    controller
        .bind(&document)
        .with_context(|| format!("failed to list pages of {}", workspace.display()))?;
    let outcome = controller.start_loading().run().await;
    debug!(?outcome, "loading finished");

    let store = controller.store();
    let rows: Vec<PageRow<'_>> = store.rows().iter().map(PageRow::from).collect();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &rows)?;
        writeln!(out)?;
    } else {
        for row in &rows {
            writeln!(out, "{}\t{}", row.page_id, row.label)?;
        }
    }
    Ok(())
}

fn print_tools(settings: &Settings) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if settings.tools.is_empty() && settings.rejected_tools.is_empty() {
        writeln!(out, "No tools configured")?;
    }
    for tool in &settings.tools {
        writeln!(
            out,
            "{}\t{}\t{}",
            tool.name,
            tool.shortcut.as_deref().unwrap_or("-"),
            tool.commandline
        )?;
    }
    for rejected in &settings.rejected_tools {
        writeln!(out, "{}\trejected\t{}", rejected.name, rejected.reason)?;
    }
    Ok(())
}

fn launch(settings: &Settings, workspace: &Path, tool: &str, page: &str) -> Result<()> {
    let document = open_document(workspace)?;
    if document.page_position(page).is_none() {
        bail!("workspace has no page {page:?}");
    }
    let file = PageCatalog::file_for_page(&document, page, &settings.file_groups)?
        .ok_or_else(|| anyhow!("page {page:?} has no image in the preferred file groups"))?;

    let launcher = Launcher::from_settings(settings);
    let Some(mut child) = launcher.launch(tool, &document, &file)? else {
        bail!("tool {tool:?} is not configured");
    };
    let status = child
        .wait()
        .with_context(|| format!("failed to wait for tool {tool:?}"))?;
    if !status.success() {
        bail!("tool {tool:?} exited with {status}");
    }
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs, console: bool) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(log_dir, "ocrd-browser.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // Raw mode owns the terminal while browsing.
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;
    Ok(guard)
}

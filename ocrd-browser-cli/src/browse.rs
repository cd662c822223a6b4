use std::io::{self, Write};
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossterm::cursor;
use crossterm::event;
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use ocrd_browser_core::{
    BrowserWindow, Document, FileGroups, ImageDecoder, Launcher, LoadStep, PageCatalog,
    PageSelected, PreviewImage, PreviewListController, RowState, Settings, View,
};
use ocrd_browser_render::FileImageDecoder;
use ocrd_browser_tty::{
    ellipsize_middle, write_status_line, BrowserCommand, DrawParams, EventMapper, KittyRenderer,
    UiEvent,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PAGE_WIDTH: u32 = 1200;
const MIN_LIST_COLUMNS: u32 = 20;
const MAX_LIST_COLUMNS: u32 = 60;

/// How much of the screen the next redraw has to repaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Repaint {
    None,
    /// Page list and status line only; the page image stays in place.
    Text,
    Full,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[derive(Debug, Clone, Default)]
enum PagePreview {
    #[default]
    Empty,
    Loaded(Arc<PreviewImage>),
    Unavailable(String),
}

/// Full-size image of the active page.
struct PageView {
    file_groups: FileGroups,
    decoder: FileImageDecoder,
    preview: Arc<Mutex<PagePreview>>,
}

impl PageView {
    fn new(file_groups: FileGroups) -> Self {
        Self {
            file_groups,
            decoder: FileImageDecoder::new(),
            preview: Arc::default(),
        }
    }

    fn preview(&self) -> Arc<Mutex<PagePreview>> {
        Arc::clone(&self.preview)
    }

    fn load(&self, document: &Document, page_id: &str) -> Result<PreviewImage> {
        let file = PageCatalog::file_for_page(document, page_id, &self.file_groups)?
            .ok_or_else(|| anyhow!("page {page_id} has no image"))?;
        let path = document.path(&file.local_filename);
        let decoded = self
            .decoder
            .decode_scaled(&path, PAGE_WIDTH)
            .with_context(|| format!("failed to load {}", path.display()))?;
        Ok(decoded.thumbnail)
    }
}

impl View for PageView {
    fn set_document(&mut self, _document: &Document) {
        *self.preview.lock() = PagePreview::Empty;
    }

    fn page_activated(&mut self, document: &Document, page_id: &str) {
        let preview = match self.load(document, page_id) {
            Ok(image) => PagePreview::Loaded(Arc::new(image)),
            Err(err) => {
                warn!(%page_id, "{err:#}");
                PagePreview::Unavailable(format!("{err:#}"))
            }
        };
        *self.preview.lock() = preview;
    }
}

pub async fn run(settings: &Settings, workspace: &Path, page: Option<&str>) -> Result<()> {
    let document = super::open_document(workspace)?;
    let mut controller = super::new_controller(settings);
    controller
        .bind(&document)
        .with_context(|| format!("failed to list pages of {}", workspace.display()))?;

    let selections: Arc<Mutex<Vec<PageSelected>>> = Arc::default();
    let queue = Arc::clone(&selections);
    controller.subscribe(move |event| queue.lock().push(event.clone()));

    let page_view = PageView::new(settings.file_groups.clone());
    let preview = page_view.preview();
    let mut window = BrowserWindow::new();
    window.add_view(Box::new(page_view));
    window.open(document);

    match page {
        Some(page_id) => {
            controller.select_page(page_id);
            if controller.current_page_id() != Some(page_id) {
                warn!(%page_id, "page has no image, starting at the first page");
                controller.goto_first();
            }
        }
        None => controller.goto_first(),
    }

    let launcher = Launcher::from_settings(settings);
    let mut mapper = EventMapper::with_tools(launcher.tools());
    let mut loader = Some(controller.start_loading());
    let mut children: Vec<Child> = Vec::new();
    let mut message: Option<String> = None;

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut repaint = Repaint::Full;

    loop {
        let selected = std::mem::take(&mut *selections.lock());
        for event in selected {
            if window.page_selected(&event.page_id) {
                repaint = Repaint::Full;
            }
        }

        if repaint != Repaint::None {
            let status = StatusParts {
                pending_input: mapper.pending_input(),
                message: message.as_deref(),
                loading: loader.is_some(),
            };
            let full = repaint == Repaint::Full;
            redraw(&mut renderer, &controller, &window, &preview.lock(), status, full)?;
            repaint = Repaint::None;
        }

        if let Some(active) = loader.as_mut() {
            match active.step() {
                LoadStep::Realized { .. } | LoadStep::Failed { .. } => {}
                step @ (LoadStep::Finished | LoadStep::Abandoned) => {
                    debug!(?step, "preview loading done");
                    loader = None;
                }
            }
            repaint = repaint.max(Repaint::Text);
            tokio::task::yield_now().await;
        }
        reap(&mut children);

        let timeout = if loader.is_some() {
            Duration::ZERO
        } else {
            POLL_INTERVAL
        };
        if !event::poll(timeout)? {
            continue;
        }
        match mapper.map_event(event::read()?) {
            UiEvent::Quit => break,
            UiEvent::Redraw => repaint = Repaint::Full,
            UiEvent::None => repaint = repaint.max(Repaint::Text),
            UiEvent::Command(command) => {
                message = None;
                match command {
                    BrowserCommand::GotoFirst => controller.goto_first(),
                    BrowserCommand::GotoLast => controller.goto_last(),
                    BrowserCommand::GoBack { count } => controller.skip(-signed(count)),
                    BrowserCommand::GoForward { count } => controller.skip(signed(count)),
                    BrowserCommand::RefreshStale => {
                        let (stale, refreshed) = controller.refresh_stale();
                        if refreshed.is_some() {
                            loader = refreshed;
                        }
                        message = Some(format!("{stale} stale previews"));
                    }
                    BrowserCommand::LaunchTool { name } => {
                        message = Some(match launch_on_page(&launcher, &window, settings, &name) {
                            Ok(Some(child)) => {
                                children.push(child);
                                format!("Started {name}")
                            }
                            Ok(None) => format!("Tool {name} is not configured"),
                            Err(err) => {
                                warn!(tool = %name, "{err:#}");
                                format!("{err:#}")
                            }
                        });
                    }
                }
                repaint = repaint.max(Repaint::Text);
            }
        }
    }

    renderer.delete_images()?;
    renderer.clear_all()?;
    Ok(())
}

fn signed(count: usize) -> isize {
    isize::try_from(count).unwrap_or(isize::MAX)
}

fn launch_on_page(
    launcher: &Launcher,
    window: &BrowserWindow,
    settings: &Settings,
    tool: &str,
) -> Result<Option<Child>> {
    let page_id = window
        .current_page_id()
        .ok_or_else(|| anyhow!("no page selected"))?;
    let document = window.document();
    let file = PageCatalog::file_for_page(document, page_id, &settings.file_groups)?
        .ok_or_else(|| anyhow!("page {page_id} has no image"))?;
    Ok(launcher.launch(tool, document, &file)?)
}

/// Waits on tools that have exited so they do not linger as zombies.
fn reap(children: &mut Vec<Child>) {
    children.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            debug!(pid = child.id(), %status, "tool exited");
            false
        }
        Ok(None) => true,
        Err(err) => {
            warn!(pid = child.id(), %err, "lost track of tool");
            false
        }
    });
}

struct StatusParts<'a> {
    pending_input: Option<String>,
    message: Option<&'a str>,
    loading: bool,
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    controller: &PreviewListController,
    window: &BrowserWindow,
    preview: &PagePreview,
    status: StatusParts<'_>,
    full: bool,
) -> Result<()> {
    let size = terminal::window_size()?;
    let total_cols = u32::from(size.columns).max(1);
    let total_rows = u32::from(size.rows).max(1);
    let list_cols = (total_cols / 3)
        .clamp(MIN_LIST_COLUMNS, MAX_LIST_COLUMNS)
        .min(total_cols);
    let body_rows = total_rows.saturating_sub(2);

    renderer.begin_sync_update()?;
    if full {
        renderer.clear_all()?;
        let header = format!("{}  {}", window.title(), window.subtitle());
        print_line(renderer.writer(), 0, 0, &ellipsize_middle(&header, total_cols as usize), true)?;
    }

    let loaded = {
        let store = controller.store();
        let first = scroll_offset(controller.current_index(), store.len(), body_rows as usize);
        let text_width = list_cols.saturating_sub(2) as usize;
        for (line, index) in (first..store.len()).take(body_rows as usize).enumerate() {
            let Some(row) = store.at(index) else {
                break;
            };
            let marker = match row.state() {
                RowState::Pending => '~',
                RowState::Realized => ' ',
                RowState::Failed => '!',
            };
            let text = format!(
                "{marker} {:<text_width$}",
                ellipsize_middle(row.label(), text_width)
            );
            let selected = controller.current_index() == Some(index);
            print_line(renderer.writer(), 0, line as u16 + 1, &text, selected)?;
        }
        (store.len() - store.pending_count(), store.len())
    };

    let image_col = list_cols + 1;
    let image_cols = total_cols.saturating_sub(image_col);
    if full && image_cols > 0 && body_rows > 0 {
        match preview {
            PagePreview::Loaded(image) => {
                let cell = cell_size(size.width, size.height, total_cols, total_rows);
                let (cols, rows) = fit_cells(image, image_cols, body_rows, cell);
                crossterm::queue!(renderer.writer(), cursor::MoveTo(image_col as u16, 1))?;
                renderer.draw(image, DrawParams::clamped(cols, rows))?;
            }
            PagePreview::Unavailable(reason) => {
                let text = ellipsize_middle(reason, image_cols as usize);
                print_line(renderer.writer(), image_col as u16, 1, &text, false)?;
            }
            PagePreview::Empty => {}
        }
    }

    let mut line = window.page_label().to_string();
    if status.loading {
        line.push_str(&format!(" | loading {}/{}", loaded.0, loaded.1));
    }
    if let Some(message) = status.message {
        line.push_str(" | ");
        line.push_str(message);
    }
    if let Some(pending) = status.pending_input {
        line.push_str(" | ");
        line.push_str(&pending);
    }
    {
        let writer = renderer.writer();
        crossterm::queue!(
            writer,
            cursor::MoveTo(0, total_rows.saturating_sub(1) as u16),
            Clear(ClearType::CurrentLine)
        )?;
        write_status_line(writer, &ellipsize_middle(&line, total_cols as usize))?;
    }
    renderer.end_sync_update()?;
    Ok(())
}

fn print_line(writer: &mut impl Write, col: u16, row: u16, text: &str, inverted: bool) -> Result<()> {
    crossterm::queue!(writer, cursor::MoveTo(col, row))?;
    if inverted {
        crossterm::queue!(
            writer,
            SetAttribute(Attribute::Reverse),
            Print(text),
            SetAttribute(Attribute::Reset)
        )?;
    } else {
        crossterm::queue!(writer, Print(text))?;
    }
    Ok(())
}

/// First list row to show so that `current` stays roughly centered.
fn scroll_offset(current: Option<usize>, len: usize, visible: usize) -> usize {
    let Some(current) = current else {
        return 0;
    };
    if len <= visible {
        return 0;
    }
    current
        .saturating_sub(visible / 2)
        .min(len - visible)
}

/// Pixel size of one terminal cell, falling back to a 1:2 cell when the terminal does
/// not report pixel dimensions.
fn cell_size(pixel_width: u16, pixel_height: u16, cols: u32, rows: u32) -> (f32, f32) {
    if pixel_width == 0 || pixel_height == 0 {
        return (1.0, 2.0);
    }
    (
        f32::from(pixel_width) / cols as f32,
        f32::from(pixel_height) / rows as f32,
    )
}

/// Largest cell box with the image's aspect ratio that fits `max_cols` by `max_rows`.
fn fit_cells(image: &PreviewImage, max_cols: u32, max_rows: u32, cell: (f32, f32)) -> (u32, u32) {
    let (cell_width, cell_height) = cell;
    if image.width == 0 || image.height == 0 {
        return (max_cols.max(1), max_rows.max(1));
    }
    let scale = (max_cols as f32 * cell_width / image.width as f32)
        .min(max_rows as f32 * cell_height / image.height as f32);
    let cols = (image.width as f32 * scale / cell_width).round();
    let rows = (image.height as f32 * scale / cell_height).round();
    (
        (cols as u32).clamp(1, max_cols.max(1)),
        (rows as u32).clamp(1, max_rows.max(1)),
    )
}

use tracing::debug;

use crate::document::Document;

const UNNAMED_TITLE: &str = "<unnamed>";

/// A page-specific panel that follows the selected page.
pub trait View: Send {
    fn set_document(&mut self, document: &Document);
    fn page_activated(&mut self, document: &Document, page_id: &str);
}

/// Which navigation actions make sense for the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionState {
    pub goto_first: bool,
    pub go_back: bool,
    pub go_forward: bool,
    pub goto_last: bool,
}

/// Window chrome state: title, current page label, navigation actions and the views
/// that get told about page changes.
pub struct BrowserWindow {
    document: Document,
    title: String,
    subtitle: String,
    current_page_id: Option<String>,
    page_label: String,
    actions: ActionState,
    views: Vec<(String, Box<dyn View>)>,
    views_created: usize,
}

impl Default for BrowserWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserWindow {
    pub fn new() -> Self {
        Self {
            document: Document::empty(),
            title: String::new(),
            subtitle: String::new(),
            current_page_id: None,
            page_label: String::new(),
            actions: ActionState::default(),
            views: Vec::new(),
            views_created: 0,
        }
    }

    /// Shows `document` and activates its first page, if it has one.
    pub fn open(&mut self, document: Document) {
        self.title = document
            .unique_identifier()
            .unwrap_or(UNNAMED_TITLE)
            .to_string();
        self.subtitle = document.directory().display().to_string();
        self.current_page_id = None;
        self.page_label.clear();
        for (_, view) in self.views.iter_mut() {
            view.set_document(&document);
        }
        self.document = document;
        self.update_actions();

        if let Some(first) = self.document.page_ids().first().cloned() {
            self.page_selected(&first);
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn subtitle(&self) -> &str {
        &self.subtitle
    }

    pub fn page_label(&self) -> &str {
        &self.page_label
    }

    pub fn actions(&self) -> ActionState {
        self.actions
    }

    pub fn current_page_id(&self) -> Option<&str> {
        self.current_page_id.as_deref()
    }

    /// Records the newly selected page and fans it out to every view. Returns `false`
    /// when `page_id` was already current.
    pub fn page_selected(&mut self, page_id: &str) -> bool {
        if self.current_page_id.as_deref() == Some(page_id) {
            return false;
        }
        self.current_page_id = Some(page_id.to_string());
        let total = self.document.page_ids().len();
        self.page_label = match self.document.page_position(page_id) {
            Some(index) => format!("#{} ({}/{})", page_id, index + 1, total),
            None => format!("#{}", page_id),
        };
        for (name, view) in self.views.iter_mut() {
            debug!(view = %name, %page_id, "activating page");
            view.page_activated(&self.document, page_id);
        }
        self.update_actions();
        true
    }

    pub fn add_view(&mut self, mut view: Box<dyn View>) -> String {
        let name = format!("view_{}", self.views_created);
        self.views_created += 1;
        view.set_document(&self.document);
        if let Some(page_id) = self.current_page_id.as_deref() {
            view.page_activated(&self.document, page_id);
        }
        self.views.push((name.clone(), view));
        name
    }

    pub fn close_view(&mut self, name: &str) -> bool {
        let before = self.views.len();
        self.views.retain(|(known, _)| known != name);
        self.views.len() != before
    }

    pub fn view_names(&self) -> impl Iterator<Item = &str> {
        self.views.iter().map(|(name, _)| name.as_str())
    }

    fn update_actions(&mut self) {
        let pages = self.document.page_ids();
        let position = self
            .current_page_id
            .as_deref()
            .and_then(|page_id| self.document.page_position(page_id));
        let (can_go_back, can_go_forward) = match position {
            Some(index) if !pages.is_empty() => (index > 0, index + 1 < pages.len()),
            _ => (false, false),
        };
        self.actions = ActionState {
            goto_first: can_go_back,
            go_back: can_go_back,
            go_forward: can_go_forward,
            goto_last: can_go_forward,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::SAMPLE_METS;
    use crate::document::Mets;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingView {
        activated: Arc<Mutex<Vec<String>>>,
    }

    impl View for RecordingView {
        fn set_document(&mut self, _document: &Document) {}

        fn page_activated(&mut self, _document: &Document, page_id: &str) {
            self.activated.lock().push(page_id.to_string());
        }
    }

    fn sample_document() -> Document {
        Document::from_index("/data/ws", "mets.xml", Arc::new(Mets::parse(SAMPLE_METS).unwrap()))
    }

    #[test]
    fn open_sets_title_and_activates_first_page() {
        let mut window = BrowserWindow::new();
        window.open(sample_document());

        assert_eq!(window.title(), "https://example.org/doc");
        assert_eq!(window.subtitle(), "/data/ws");
        assert_eq!(window.current_page_id(), Some("PHYS_0001"));
        assert_eq!(window.page_label(), "#PHYS_0001 (1/3)");
        assert_eq!(
            window.actions(),
            ActionState {
                goto_first: false,
                go_back: false,
                go_forward: true,
                goto_last: true,
            }
        );
    }

    #[test]
    fn unnamed_documents_get_a_placeholder_title() {
        let mut window = BrowserWindow::new();
        window.open(Document::empty());
        assert_eq!(window.title(), "<unnamed>");
        assert_eq!(window.current_page_id(), None);
        assert_eq!(window.actions(), ActionState::default());
    }

    #[test]
    fn views_only_hear_about_changed_pages() {
        let activated = Arc::new(Mutex::new(Vec::new()));
        let mut window = BrowserWindow::new();
        let name = window.add_view(Box::new(RecordingView {
            activated: Arc::clone(&activated),
        }));
        assert_eq!(name, "view_0");

        window.open(sample_document());
        assert!(!window.page_selected("PHYS_0001"));
        assert!(window.page_selected("PHYS_0003"));
        assert_eq!(window.page_label(), "#PHYS_0003 (3/3)");
        assert!(window.actions().go_back);
        assert!(!window.actions().goto_last);

        assert!(window.close_view(&name));
        window.page_selected("PHYS_0002");
        assert_eq!(*activated.lock(), vec!["PHYS_0001", "PHYS_0003"]);
        assert_eq!(window.view_names().count(), 0);
    }
}

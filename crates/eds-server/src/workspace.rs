//! Headless document and window manager.
//!
//! Keeps just enough editor state (windows, tabs, desktops, focus, busy
//! flags) for the dispatcher to make every decision it makes against a real
//! editor, and journals what it was asked to do.

use crate::registry::{
    DesktopId, DocumentId, DocumentInfo, DocumentRegistry, MacroEngine, NewDocumentRequest,
    OpenRequest, WindowId,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    Opened {
        doc: DocumentId,
        window: WindowId,
        path: PathBuf,
        reused: bool,
    },
    Created {
        doc: DocumentId,
        window: WindowId,
    },
    Raised {
        doc: DocumentId,
        focus: bool,
    },
    LineSelected {
        doc: DocumentId,
        line: u32,
    },
    Closed {
        doc: DocumentId,
    },
    Beep,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub window: WindowId,
    pub path: Option<PathBuf>,
    pub read_only: bool,
    pub modified: bool,
    pub macro_running: bool,
    pub language_mode: Option<String>,
    pub highlight_deferred: bool,
    pub selected_line: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Window {
    pub id: WindowId,
    pub desktop: Option<DesktopId>,
    pub iconic: bool,
    pub geometry: Option<String>,
    pub top: Option<DocumentId>,
}

pub struct Workspace {
    documents: Vec<Document>,
    windows: Vec<Window>,
    next_doc: u64,
    next_window: u64,
    current_desktop: Option<DesktopId>,
    open_in_tab: bool,
    focused: Option<DocumentId>,
    bells: usize,
    journal: Vec<WorkspaceEvent>,
}

impl Workspace {
    pub fn new(open_in_tab: bool, current_desktop: Option<DesktopId>) -> Self {
        Self {
            documents: Vec::new(),
            windows: Vec::new(),
            next_doc: 0,
            next_window: 0,
            current_desktop,
            open_in_tab,
            focused: None,
            bells: 0,
            journal: Vec::new(),
        }
    }

    pub fn document(&self, doc: DocumentId) -> Option<&Document> {
        self.documents.iter().find(|entry| entry.id == doc)
    }

    fn document_mut(&mut self, doc: DocumentId) -> Option<&mut Document> {
        self.documents.iter_mut().find(|entry| entry.id == doc)
    }

    pub fn window(&self, window: WindowId) -> Option<&Window> {
        self.windows.iter().find(|entry| entry.id == window)
    }

    fn window_mut(&mut self, window: WindowId) -> Option<&mut Window> {
        self.windows.iter_mut().find(|entry| entry.id == window)
    }

    pub fn tabs_of(&self, window: WindowId) -> Vec<DocumentId> {
        self.documents
            .iter()
            .filter(|entry| entry.window == window)
            .map(|entry| entry.id)
            .collect()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn focused(&self) -> Option<DocumentId> {
        self.focused
    }

    pub fn bells(&self) -> usize {
        self.bells
    }

    pub fn journal(&self) -> &[WorkspaceEvent] {
        &self.journal
    }

    pub fn set_macro_running(&mut self, doc: DocumentId, running: bool) {
        if let Some(entry) = self.document_mut(doc) {
            entry.macro_running = running;
        }
    }

    pub fn set_modified(&mut self, doc: DocumentId, modified: bool) {
        if let Some(entry) = self.document_mut(doc) {
            entry.modified = modified;
        }
    }

    pub fn set_current_desktop(&mut self, desktop: Option<DesktopId>) {
        self.current_desktop = desktop;
    }

    pub fn move_window(&mut self, window: WindowId, desktop: Option<DesktopId>) {
        if let Some(entry) = self.window_mut(window) {
            entry.desktop = desktop;
        }
    }

    fn add_window(&mut self, iconic: bool, geometry: Option<String>) -> WindowId {
        self.next_window += 1;
        let id = WindowId(self.next_window);
        self.windows.push(Window {
            id,
            desktop: self.current_desktop,
            iconic,
            geometry,
            top: None,
        });
        id
    }

    fn add_document(&mut self, window: WindowId, path: Option<PathBuf>) -> DocumentId {
        self.next_doc += 1;
        let id = DocumentId(self.next_doc);
        self.documents.push(Document {
            id,
            window,
            path,
            read_only: false,
            modified: false,
            macro_running: false,
            language_mode: None,
            highlight_deferred: false,
            selected_line: None,
        });
        if let Some(entry) = self.window_mut(window) {
            if entry.top.is_none() {
                entry.top = Some(id);
            }
        }
        id
    }

    /// Window for a new document: a tab next to `target` or a fresh window.
    fn placement(
        &mut self,
        target: Option<DocumentId>,
        in_tab: bool,
        iconic: bool,
        geometry: Option<String>,
    ) -> WindowId {
        let target_window = target
            .filter(|_| in_tab)
            .and_then(|doc| self.document(doc))
            .map(|entry| entry.window);
        match target_window {
            Some(window) => window,
            None => self.add_window(iconic, geometry),
        }
    }

    fn reusable(&self, doc: DocumentId) -> bool {
        self.document(doc)
            .map(|entry| entry.path.is_none() && !entry.modified && !entry.macro_running)
            .unwrap_or(false)
    }
}

impl DocumentRegistry for Workspace {
    fn documents(&self) -> Vec<DocumentInfo> {
        self.documents
            .iter()
            .map(|entry| {
                let window = self.window(entry.window);
                DocumentInfo {
                    id: entry.id,
                    window: entry.window,
                    path: entry.path.clone(),
                    modified: entry.modified,
                    macro_running: entry.macro_running,
                    top: window.and_then(|w| w.top) == Some(entry.id),
                    desktop: window.and_then(|w| w.desktop),
                }
            })
            .collect()
    }

    fn find_by_path(&self, path: &Path) -> Option<DocumentId> {
        self.documents
            .iter()
            .find(|entry| entry.path.as_deref() == Some(path))
            .map(|entry| entry.id)
    }

    fn open_document(&mut self, request: OpenRequest) -> Option<DocumentId> {
        if request.path.is_dir() {
            info!(
                event = "workspace_open_refused",
                path = %request.path.display(),
                reason = "directory"
            );
            return None;
        }

        let reuse = request.target.filter(|doc| self.reusable(*doc));
        let (doc, reused) = match reuse {
            Some(doc) => {
                if let Some(entry) = self.document_mut(doc) {
                    entry.path = Some(request.path.clone());
                }
                (doc, true)
            }
            None => {
                let window = self.placement(
                    request.target,
                    request.in_tab,
                    request.iconic,
                    request.geometry.clone(),
                );
                (self.add_document(window, Some(request.path.clone())), false)
            }
        };

        let window = {
            let entry = self.document_mut(doc)?;
            entry.read_only = request.read_only;
            entry.language_mode = request.language_mode.clone();
            entry.highlight_deferred = request.defer_highlighting;
            entry.window
        };
        debug!(
            event = "workspace_opened",
            doc = %doc,
            window = %window,
            path = %request.path.display(),
            reused
        );
        self.journal.push(WorkspaceEvent::Opened {
            doc,
            window,
            path: request.path,
            reused,
        });
        Some(doc)
    }

    fn new_document(&mut self, request: NewDocumentRequest) -> DocumentId {
        let window = self.placement(request.target, true, request.iconic, request.geometry);
        let doc = self.add_document(window, None);
        if let Some(entry) = self.document_mut(doc) {
            entry.language_mode = request.language_mode;
        }
        if let Some(entry) = self.window_mut(window) {
            entry.top = Some(doc);
        }
        debug!(event = "workspace_created", doc = %doc, window = %window);
        self.journal.push(WorkspaceEvent::Created { doc, window });
        doc
    }

    fn raise(&mut self, doc: DocumentId, focus: bool) {
        let Some(window) = self.document_mut(doc).map(|entry| {
            entry.highlight_deferred = false;
            entry.window
        }) else {
            return;
        };
        if let Some(entry) = self.window_mut(window) {
            entry.top = Some(doc);
            if focus {
                entry.iconic = false;
            }
        }
        if focus {
            self.focused = Some(doc);
        }
        self.journal.push(WorkspaceEvent::Raised { doc, focus });
    }

    fn select_line(&mut self, doc: DocumentId, line: u32) {
        if let Some(entry) = self.document_mut(doc) {
            entry.selected_line = Some(line);
            self.journal.push(WorkspaceEvent::LineSelected { doc, line });
        }
    }

    fn is_macro_running(&self, doc: DocumentId) -> bool {
        self.document(doc)
            .map(|entry| entry.macro_running)
            .unwrap_or(false)
    }

    fn is_valid(&self, doc: DocumentId) -> bool {
        self.document(doc).is_some()
    }

    fn close_document(&mut self, doc: DocumentId) -> bool {
        let Some(idx) = self.documents.iter().position(|entry| entry.id == doc) else {
            return false;
        };
        let window = self.documents.remove(idx).window;
        let remaining = self.tabs_of(window);
        if remaining.is_empty() {
            self.windows.retain(|entry| entry.id != window);
        } else if let Some(entry) = self.window_mut(window) {
            if entry.top == Some(doc) {
                entry.top = remaining.first().copied();
            }
        }
        if self.focused == Some(doc) {
            self.focused = None;
        }
        self.journal.push(WorkspaceEvent::Closed { doc });
        true
    }

    fn window_of(&self, doc: DocumentId) -> Option<WindowId> {
        self.document(doc).map(|entry| entry.window)
    }

    fn current_desktop(&self) -> Option<DesktopId> {
        self.current_desktop
    }

    fn open_in_tab(&self) -> bool {
        self.open_in_tab
    }

    fn beep(&mut self) {
        self.bells += 1;
        self.journal.push(WorkspaceEvent::Beep);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroRun {
    pub doc: DocumentId,
    pub command: String,
    pub origin: String,
}

/// Macro engine for the headless server.
///
/// Records every run. The command `close()` closes the document it runs in;
/// everything else is only logged.
#[derive(Debug, Default)]
pub struct LoggingMacroEngine {
    history: Vec<MacroRun>,
}

impl LoggingMacroEngine {
    pub fn history(&self) -> &[MacroRun] {
        &self.history
    }
}

impl MacroEngine for LoggingMacroEngine {
    fn run(
        &mut self,
        registry: &mut dyn DocumentRegistry,
        doc: DocumentId,
        command: &str,
        origin: &str,
    ) {
        info!(event = "macro_run", doc = %doc, origin, command);
        self.history.push(MacroRun {
            doc,
            command: command.to_string(),
            origin: origin.to_string(),
        });
        if command.trim() == "close()" {
            registry.close_document(doc);
        }
    }
}

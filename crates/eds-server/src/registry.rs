//! Seams between the dispatcher and the editor it drives.

use std::fmt;
use std::path::{Path, PathBuf};

/// Origin label passed to the macro engine for `-do` commands.
pub const DO_MACRO_ORIGIN: &str = "-do macro";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "win-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DesktopId(pub u32);

impl DesktopId {
    /// Windows on this desktop are visible on every desktop.
    pub const STICKY: Self = Self(0xFFFF_FFFF);
}

/// Whether a window on `window` is visible from `current`. Missing desktop
/// information on either side matches anything.
pub fn on_desktop(window: Option<DesktopId>, current: Option<DesktopId>) -> bool {
    match (window, current) {
        (Some(window), Some(current)) => {
            window == current || window == DesktopId::STICKY || current == DesktopId::STICKY
        }
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub window: WindowId,
    /// `None` for untitled documents.
    pub path: Option<PathBuf>,
    pub modified: bool,
    pub macro_running: bool,
    /// Currently displayed tab of its window.
    pub top: bool,
    pub desktop: Option<DesktopId>,
}

impl DocumentInfo {
    pub fn is_untitled_unmodified(&self) -> bool {
        self.path.is_none() && !self.modified
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Document whose window should receive the file; `None` opens a new window.
    pub target: Option<DocumentId>,
    pub path: PathBuf,
    pub read_only: bool,
    pub suppress_create_warning: bool,
    pub geometry: Option<String>,
    pub iconic: bool,
    pub language_mode: Option<String>,
    pub in_tab: bool,
    pub defer_highlighting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocumentRequest {
    pub target: Option<DocumentId>,
    pub iconic: bool,
    pub language_mode: Option<String>,
    pub geometry: Option<String>,
}

/// Document and window manager driven by the dispatcher.
///
/// `documents` returns window-list order: the order searches walk.
pub trait DocumentRegistry {
    fn documents(&self) -> Vec<DocumentInfo>;
    fn find_by_path(&self, path: &Path) -> Option<DocumentId>;
    /// Opens or reuses a document; `None` when the file could not be opened.
    fn open_document(&mut self, request: OpenRequest) -> Option<DocumentId>;
    fn new_document(&mut self, request: NewDocumentRequest) -> DocumentId;
    fn raise(&mut self, doc: DocumentId, focus: bool);
    fn select_line(&mut self, doc: DocumentId, line: u32);
    fn is_macro_running(&self, doc: DocumentId) -> bool;
    fn is_valid(&self, doc: DocumentId) -> bool;
    fn close_document(&mut self, doc: DocumentId) -> bool;
    fn window_of(&self, doc: DocumentId) -> Option<WindowId>;
    fn current_desktop(&self) -> Option<DesktopId>;
    fn open_in_tab(&self) -> bool;
    fn beep(&mut self);
}

/// Executes macro commands. Failures are reported inside the document.
pub trait MacroEngine {
    fn run(
        &mut self,
        registry: &mut dyn DocumentRegistry,
        doc: DocumentId,
        command: &str,
        origin: &str,
    );
}

use crate::registry::{on_desktop, DesktopId, DocumentId, DocumentInfo};
use eds_core::TabPlacement;

/// Whether a record should land in its own window rather than a tab.
pub fn wants_new_window(placement: TabPlacement, open_in_tab: bool) -> bool {
    match placement {
        TabPlacement::NewWindow => true,
        TabPlacement::InGroup => false,
        TabPlacement::Default => !open_in_tab,
    }
}

/// Picks the document whose window receives a new file.
///
/// New-window requests reuse an untitled, unmodified, idle document on the
/// current desktop; tab requests join the first displayed document there.
pub fn find_target(
    documents: &[DocumentInfo],
    new_window: bool,
    desktop: Option<DesktopId>,
) -> Option<DocumentId> {
    documents
        .iter()
        .filter(|doc| on_desktop(doc.desktop, desktop))
        .find(|doc| {
            if new_window {
                doc.is_untitled_unmodified() && !doc.macro_running
            } else {
                doc.top
            }
        })
        .map(|doc| doc.id)
}

/// Untitled, unmodified document shown by an empty request.
pub fn find_untitled(documents: &[DocumentInfo], desktop: Option<DesktopId>) -> Option<DocumentId> {
    documents
        .iter()
        .find(|doc| doc.is_untitled_unmodified() && on_desktop(doc.desktop, desktop))
        .map(|doc| doc.id)
}

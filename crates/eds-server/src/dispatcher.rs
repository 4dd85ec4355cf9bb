//! Turns request slot writes into editor actions.

use crate::affinity::{find_target, find_untitled, wants_new_window};
use crate::channel::{Channel, ChannelError};
use crate::presence::PresenceAdvertiser;
use crate::registry::{
    DocumentId, DocumentRegistry, MacroEngine, NewDocumentRequest, OpenRequest, DO_MACRO_ORIGIN,
};
use eds_core::channel_ipc::{SlotChange, SlotEvent};
use eds_core::paths::{parse_filename, path_from_bytes};
use eds_core::request::{DecodeError, RecordDecoder};
use eds_core::{RequestRecord, ServerIdentity, SlotKind, SlotName, TabPlacement};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one drained request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub parse_error: Option<DecodeError>,
    pub raised: Option<DocumentId>,
}

#[derive(Debug, Clone, Copy)]
struct LastTouched {
    doc: DocumentId,
    iconic: bool,
}

pub struct Dispatcher<R, M> {
    identity: ServerIdentity,
    channel: Arc<dyn Channel>,
    registry: R,
    macros: M,
    presence: PresenceAdvertiser,
    closed_slots: HashMap<DocumentId, SlotName>,
    cwd: PathBuf,
}

impl<R: DocumentRegistry, M: MacroEngine> Dispatcher<R, M> {
    pub fn new(
        identity: ServerIdentity,
        channel: Arc<dyn Channel>,
        registry: R,
        macros: M,
        cwd: PathBuf,
    ) -> Self {
        let presence = PresenceAdvertiser::new(channel.clone(), identity.presence_slot());
        Self {
            identity,
            channel,
            registry,
            macros,
            presence,
            closed_slots: HashMap::new(),
            cwd,
        }
    }

    /// Advertises the server. Call once the caller is receiving channel events.
    pub fn start(&mut self) -> Result<(), ChannelError> {
        self.presence.start()
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn macros(&self) -> &M {
        &self.macros
    }

    pub fn is_advertising(&self) -> bool {
        self.presence.is_advertising()
    }

    /// FileClosed slot captured for `doc`, if a waiting client asked for one.
    pub fn closed_slot(&self, doc: DocumentId) -> Option<&SlotName> {
        self.closed_slots.get(&doc)
    }

    pub fn into_parts(mut self) -> (R, M) {
        self.presence.stop();
        (self.registry, self.macros)
    }

    pub fn handle_event(&mut self, event: &SlotEvent) -> Option<BatchReport> {
        match (self.identity.classify(&event.slot), event.change) {
            (SlotKind::Request, SlotChange::NewValue) => self.drain_request(),
            (SlotKind::Presence, SlotChange::Deleted) => {
                self.presence.handle_deleted();
                None
            }
            _ => None,
        }
    }

    /// Takes whatever is in the request slot and applies it.
    pub fn drain_request(&mut self) -> Option<BatchReport> {
        let slot = self.identity.request_slot();
        match self.channel.read_and_clear(&slot) {
            Ok(Some(value)) => Some(self.process_request(&value)),
            Ok(None) => {
                debug!(event = "request_already_drained", slot = %slot);
                None
            }
            Err(err) => {
                warn!(event = "request_read_error", slot = %slot, error = %err);
                None
            }
        }
    }

    /// Re-checks state that change notifications would normally maintain.
    pub fn resync(&mut self) -> Option<BatchReport> {
        self.presence.ensure();
        self.drain_request()
    }

    pub fn process_request(&mut self, bytes: &[u8]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut last = None;

        if bytes.is_empty() {
            // Same as a single record with no path and no macro.
            self.apply_record(&RequestRecord::default(), &mut last);
            report.applied = 1;
        } else {
            let mut decoder = RecordDecoder::new(bytes);
            while let Some(record) = decoder.next() {
                match record {
                    Ok(record) => {
                        self.apply_record(&record, &mut last);
                        report.applied += 1;
                    }
                    Err(err) => {
                        error!(
                            event = "request_parse_error",
                            applied = report.applied,
                            error = %err
                        );
                        eprintln!("eds-server: error processing server request: {err}");
                        self.release_unprocessed(&decoder);
                        report.parse_error = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(last) = last.filter(|last: &LastTouched| self.registry.is_valid(last.doc)) {
            self.registry.raise(last.doc, !last.iconic);
            report.raised = Some(last.doc);
        }

        info!(
            event = "request_processed",
            applied = report.applied,
            parse_error = report.parse_error.is_some(),
            raised = report.raised.map(|doc| doc.0)
        );
        report
    }

    fn apply_record(&mut self, record: &RequestRecord, last: &mut Option<LastTouched>) {
        if !record.has_path() {
            self.apply_pathless(record, last);
            return;
        }

        let parsed = match parse_filename(&record.file_path, &self.cwd) {
            Ok(parsed) => parsed,
            Err(err) => {
                let shown = String::from_utf8_lossy(&record.file_path);
                warn!(event = "invalid_file_name", path = %shown, error = %err);
                eprintln!("eds-server: invalid file name: {shown}");
                self.release_file_slots(&record.file_path);
                return;
            }
        };
        let name = parsed.full_path();
        let path = path_from_bytes(&name);

        let doc = match self.registry.find_by_path(&path) {
            Some(doc) => Some(doc),
            None => self.open_new(record, &path, *last),
        };
        let Some(doc) = doc else {
            warn!(event = "file_open_failed", path = %path.display());
            self.release_file_slots(&name);
            return;
        };

        self.signal_opened(doc, &name);
        if let Some(line) = record.target_line() {
            self.registry.select_line(doc, line);
        }

        let mut alive = true;
        if record.has_macro() {
            // Raised before the macro runs; the macro may close the document.
            self.registry.raise(doc, !record.iconic);
            alive = self.run_macro(doc, &record.macro_text());
            forget_closed(&self.registry, last);
        }
        if alive {
            *last = Some(LastTouched {
                doc,
                iconic: record.iconic,
            });
        }
    }

    fn open_new(
        &mut self,
        record: &RequestRecord,
        path: &Path,
        last: Option<LastTouched>,
    ) -> Option<DocumentId> {
        let open_in_tab = self.registry.open_in_tab();
        let desktop = self.registry.current_desktop();
        let target = find_target(
            &self.registry.documents(),
            wants_new_window(record.tab_placement, open_in_tab),
            desktop,
        );
        let in_tab = match record.tab_placement {
            TabPlacement::NewWindow => false,
            TabPlacement::InGroup => true,
            TabPlacement::Default => open_in_tab,
        };

        let doc = self.registry.open_document(OpenRequest {
            target,
            path: path.to_path_buf(),
            read_only: record.read_only,
            suppress_create_warning: record.suppress_create_warning,
            geometry: record.geometry().map(Cow::into_owned),
            iconic: record.iconic,
            language_mode: record.language_mode().map(Cow::into_owned),
            in_tab,
            defer_highlighting: true,
        })?;

        if let Some(previous) = last {
            if self.registry.window_of(previous.doc) != self.registry.window_of(doc) {
                // Flush the previous window's deferred work before moving on.
                self.registry.raise(previous.doc, false);
            }
        }
        debug!(event = "document_opened", doc = %doc, path = %path.display(), in_tab);
        Some(doc)
    }

    /// Records after a path-less one are still applied, and a macro-less one
    /// is raised at the end of the batch rather than right away. Whether the
    /// batch should stop here instead is an open product question; see the
    /// decisions in DESIGN.md before changing it.
    fn apply_pathless(&mut self, record: &RequestRecord, last: &mut Option<LastTouched>) {
        let documents = self.registry.documents();
        let desktop = self.registry.current_desktop();

        if !record.has_macro() {
            let doc = match find_untitled(&documents, desktop) {
                Some(doc) => doc,
                None => {
                    let target = find_target(
                        &documents,
                        wants_new_window(record.tab_placement, self.registry.open_in_tab()),
                        desktop,
                    );
                    self.registry.new_document(NewDocumentRequest {
                        target,
                        iconic: record.iconic,
                        language_mode: record.language_mode().map(Cow::into_owned),
                        geometry: record.geometry().map(Cow::into_owned),
                    })
                }
            };
            *last = Some(LastTouched {
                doc,
                iconic: record.iconic,
            });
            return;
        }

        let Some(doc) = documents
            .iter()
            .find(|info| !info.macro_running)
            .map(|info| info.id)
        else {
            warn!(event = "macro_no_window", command = %record.macro_text());
            self.registry.beep();
            return;
        };

        self.registry.raise(doc, !record.iconic);
        let alive = self.run_macro(doc, &record.macro_text());
        forget_closed(&self.registry, last);
        if alive {
            *last = Some(LastTouched {
                doc,
                iconic: record.iconic,
            });
        }
    }

    /// Runs a `-do` command unless one is already running in `doc`. Returns
    /// whether `doc` still exists afterwards.
    fn run_macro(&mut self, doc: DocumentId, command: &str) -> bool {
        if self.registry.is_macro_running(doc) {
            warn!(event = "macro_busy", doc = %doc, command);
            self.registry.beep();
            return true;
        }

        self.macros
            .run(&mut self.registry, doc, command, DO_MACRO_ORIGIN);
        self.release_closed_documents();
        self.registry.is_valid(doc)
    }

    fn signal_opened(&mut self, doc: DocumentId, path: &[u8]) {
        let opened = self.identity.file_opened_slot(path);
        if let Err(err) = self.channel.delete(&opened) {
            warn!(event = "file_opened_signal_error", slot = %opened, error = %err);
        }

        let closed = self.identity.file_closed_slot(path);
        match self.channel.exists(&closed) {
            Ok(true) => {
                debug!(event = "file_closed_captured", doc = %doc, slot = %closed);
                self.closed_slots.insert(doc, closed);
            }
            Ok(false) => {}
            Err(err) => warn!(event = "file_closed_lookup_error", slot = %closed, error = %err),
        }
    }

    fn release_file_slots(&mut self, path: &[u8]) {
        for slot in [
            self.identity.file_opened_slot(path),
            self.identity.file_closed_slot(path),
        ] {
            if let Err(err) = self.channel.delete(&slot) {
                warn!(event = "file_slot_release_error", slot = %slot, error = %err);
            }
        }
    }

    /// Releases the file slots of records a parse error kept from being
    /// applied, so their clients are not left waiting.
    fn release_unprocessed(&mut self, decoder: &RecordDecoder<'_>) {
        let paths = decoder.salvage_paths();
        for raw in &paths {
            let name = parse_filename(raw, &self.cwd)
                .map(|parsed| parsed.full_path())
                .unwrap_or_else(|_| raw.clone());
            self.release_file_slots(&name);
            if name != *raw {
                self.release_file_slots(raw);
            }
        }
        if !paths.is_empty() {
            info!(event = "request_slots_salvaged", count = paths.len());
        }
    }

    fn release_closed_documents(&mut self) {
        let gone = self
            .closed_slots
            .keys()
            .copied()
            .filter(|doc| !self.registry.is_valid(*doc))
            .collect::<Vec<_>>();
        for doc in gone {
            self.document_closed(doc);
        }
    }

    /// Tells a waiting client that `doc` is gone.
    pub fn document_closed(&mut self, doc: DocumentId) {
        let Some(slot) = self.closed_slots.remove(&doc) else {
            return;
        };
        match self.channel.delete(&slot) {
            Ok(_) => info!(event = "file_closed_signaled", doc = %doc, slot = %slot),
            Err(err) => warn!(event = "file_closed_signal_error", slot = %slot, error = %err),
        }
    }

    /// Withdraws every slot this server is responsible for.
    pub fn shutdown(&mut self) {
        let captured = self.closed_slots.keys().copied().collect::<Vec<_>>();
        for doc in captured {
            self.document_closed(doc);
        }

        let prefix = self.identity.file_slot_prefix();
        match self.channel.delete_prefix(&prefix) {
            Ok(removed) if !removed.is_empty() => {
                info!(event = "file_slots_swept", count = removed.len());
            }
            Ok(_) => {}
            Err(err) => warn!(event = "file_slots_sweep_error", error = %err),
        }

        self.presence.stop();
    }
}

fn forget_closed<R: DocumentRegistry>(registry: &R, last: &mut Option<LastTouched>) {
    if last.is_some_and(|touched| !registry.is_valid(touched.doc)) {
        *last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::registry::DesktopId;
    use crate::workspace::{LoggingMacroEngine, Workspace, WorkspaceEvent};
    use eds_core::{encode_batch, RequestBatch};

    fn dispatcher() -> (
        Arc<MemoryChannel>,
        Dispatcher<Workspace, LoggingMacroEngine>,
    ) {
        let channel = Arc::new(MemoryChannel::default());
        let dispatcher = Dispatcher::new(
            ServerIdentity::new("box", "alice", ""),
            channel.clone(),
            Workspace::new(true, Some(DesktopId(1))),
            LoggingMacroEngine::default(),
            PathBuf::from("/home/alice"),
        );
        (channel, dispatcher)
    }

    fn record(path: &str) -> RequestRecord {
        RequestRecord::open(path)
    }

    #[test]
    fn relative_paths_resolve_against_server_directory() {
        let (_channel, mut dispatcher) = dispatcher();
        let batch = encode_batch(&RequestBatch::new(vec![record("notes/../todo.txt")]));
        dispatcher.process_request(&batch);
        assert!(dispatcher
            .registry()
            .find_by_path(Path::new("/home/alice/todo.txt"))
            .is_some());
    }

    #[test]
    fn reopening_a_known_path_does_not_create_a_document() {
        let (_channel, mut dispatcher) = dispatcher();
        let batch = encode_batch(&RequestBatch::new(vec![record("/tmp/a.txt")]));
        dispatcher.process_request(&batch);
        dispatcher.process_request(&batch);
        assert_eq!(dispatcher.registry().document_count(), 1);
    }

    #[test]
    fn invalid_path_releases_slots_and_continues() {
        let (channel, mut dispatcher) = dispatcher();
        let identity = dispatcher.identity().clone();
        channel
            .write(&identity.file_opened_slot("/tmp/"), b"True")
            .expect("write");
        channel
            .write(&identity.file_closed_slot("/tmp/"), b"True")
            .expect("write");

        let batch = encode_batch(&RequestBatch::new(vec![record("/tmp/"), record("/tmp/b")]));
        let report = dispatcher.process_request(&batch);

        assert_eq!(report.applied, 2);
        assert!(channel.slot_names().expect("names").is_empty());
        assert!(dispatcher.registry().find_by_path(Path::new("/tmp/b")).is_some());
    }

    #[test]
    fn failed_open_releases_slots() {
        let (channel, mut dispatcher) = dispatcher();
        let identity = dispatcher.identity().clone();
        let dir = std::env::temp_dir()
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        channel
            .write(&identity.file_opened_slot(&dir), b"True")
            .expect("write");

        let report =
            dispatcher.process_request(&encode_batch(&RequestBatch::new(vec![record(&dir)])));

        assert_eq!(report.raised, None);
        assert!(!channel
            .exists(&identity.file_opened_slot(&dir))
            .expect("exists"));
    }

    #[test]
    fn switching_windows_raises_previous_document_without_focus() {
        let (_channel, mut dispatcher) = dispatcher();
        let mut first = record("/tmp/a");
        first.tab_placement = TabPlacement::NewWindow;
        let mut second = record("/tmp/b");
        second.tab_placement = TabPlacement::NewWindow;

        dispatcher.process_request(&encode_batch(&RequestBatch::new(vec![first, second])));

        let a = dispatcher.registry().find_by_path(Path::new("/tmp/a")).expect("a");
        let b = dispatcher.registry().find_by_path(Path::new("/tmp/b")).expect("b");
        let raises = dispatcher
            .registry()
            .journal()
            .iter()
            .filter_map(|event| match event {
                WorkspaceEvent::Raised { doc, focus } => Some((*doc, *focus)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(raises, vec![(a, false), (b, true)]);
    }

    #[test]
    fn pathless_record_mid_batch_does_not_stop_processing() {
        let (_channel, mut dispatcher) = dispatcher();
        let batch = encode_batch(&RequestBatch::new(vec![
            record("/tmp/a"),
            RequestRecord::default(),
            record("/tmp/b"),
        ]));
        let report = dispatcher.process_request(&batch);
        assert_eq!(report.applied, 3);
        assert!(dispatcher.registry().find_by_path(Path::new("/tmp/b")).is_some());
    }

    #[test]
    fn document_closed_signals_waiting_client() {
        let (channel, mut dispatcher) = dispatcher();
        let identity = dispatcher.identity().clone();
        let closed = identity.file_closed_slot("/tmp/a");
        channel.write(&closed, b"True").expect("write");

        let report =
            dispatcher.process_request(&encode_batch(&RequestBatch::new(vec![record("/tmp/a")])));
        let doc = report.raised.expect("raised");
        assert_eq!(dispatcher.closed_slot(doc), Some(&closed));

        dispatcher.registry_mut().close_document(doc);
        dispatcher.document_closed(doc);
        assert!(!channel.exists(&closed).expect("exists"));
        assert_eq!(dispatcher.closed_slot(doc), None);
    }

    #[test]
    fn foreign_slots_are_ignored() {
        let (channel, mut dispatcher) = dispatcher();
        channel
            .write(&SlotName::from("NEDIT_SERVER_REQUEST_box_alice_other"), b"")
            .expect("write");
        let event = SlotEvent::new_value(SlotName::from("NEDIT_SERVER_REQUEST_box_alice_other"));
        assert_eq!(dispatcher.handle_event(&event), None);
        assert_eq!(dispatcher.registry().document_count(), 0);
    }
}

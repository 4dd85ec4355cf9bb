//! Order-sensitive command line items turned into a request batch.
//!
//! Options before a file apply to it: `-line`/`+N` and `-do` to that file
//! only, everything else to every file that follows.

use eds_core::paths::{normalize_path, os_str_bytes, PathError};
use eds_core::{RequestBatch, RequestRecord, TabPlacement};
use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;

pub const USAGE: &str = "\
Usage:  eds-cli [--server-name NAME] [--socket PATH] [--timeout SECONDS] [--wait]
               [-read] [-create] [-line n | +n] [-do command] [-lm languagemode]
               [-geometry geometry | -g geometry] [-icon | -iconic]
               [-tabbed] [-untabbed] [-group] [--] [file...]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemsError {
    #[error("unrecognized option {0}")]
    UnknownOption(String),
    #[error("option {0} requires an argument")]
    MissingValue(String),
    #[error("invalid file name {path}: {source}")]
    InvalidPath { path: String, source: PathError },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLineRequest {
    pub batch: RequestBatch,
    /// Distinct absolute paths in request order, as raw bytes.
    pub files: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedItems {
    pub request: CommandLineRequest,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Group {
    Off,
    Start,
    Member,
}

struct Pending {
    line: i32,
    macro_command: Vec<u8>,
    language_mode: Vec<u8>,
    geometry: Vec<u8>,
    read_only: bool,
    create: bool,
    iconic: bool,
    tabbed: TabPlacement,
    group: Group,
}

impl Pending {
    fn new() -> Self {
        Self {
            line: 0,
            macro_command: Vec::new(),
            language_mode: Vec::new(),
            geometry: Vec::new(),
            read_only: false,
            create: false,
            iconic: false,
            tabbed: TabPlacement::Default,
            group: Group::Off,
        }
    }

    fn placement_for_next_file(&mut self) -> TabPlacement {
        match self.group {
            Group::Start => {
                self.group = Group::Member;
                TabPlacement::NewWindow
            }
            Group::Member => TabPlacement::InGroup,
            Group::Off => self.tabbed,
        }
    }
}

/// Items are taken as raw OS strings so file names need not be UTF-8.
pub fn parse_items<S: AsRef<OsStr>>(items: &[S], cwd: &Path) -> Result<ParsedItems, ItemsError> {
    let mut parsed = ParsedItems::default();
    let mut pending = Pending::new();
    let mut records = Vec::new();
    let mut options = true;
    let raw = items
        .iter()
        .map(|item| os_str_bytes(item.as_ref()))
        .collect::<Vec<_>>();
    let mut iter = raw.iter().map(Vec::as_slice);

    while let Some(item) = iter.next() {
        if options {
            let mut value_for = |name: &[u8]| {
                iter.next()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| ItemsError::MissingValue(lossy(name)))
            };
            match item {
                b"--" => {
                    options = false;
                    continue;
                }
                b"-do" => {
                    pending.macro_command = value_for(item)?;
                    continue;
                }
                b"-lm" => {
                    pending.language_mode = value_for(item)?;
                    continue;
                }
                b"-g" | b"-geometry" => {
                    pending.geometry = value_for(item)?;
                    continue;
                }
                b"-read" => {
                    pending.read_only = true;
                    continue;
                }
                b"-create" => {
                    pending.create = true;
                    continue;
                }
                b"-tabbed" => {
                    pending.tabbed = TabPlacement::InGroup;
                    pending.group = Group::Off;
                    continue;
                }
                b"-untabbed" => {
                    pending.tabbed = TabPlacement::NewWindow;
                    pending.group = Group::Off;
                    continue;
                }
                b"-group" => {
                    pending.group = Group::Start;
                    continue;
                }
                b"-icon" | b"-iconic" => {
                    pending.iconic = true;
                    continue;
                }
                b"-line" => {
                    let value = value_for(item)?;
                    match parse_line(&String::from_utf8_lossy(&value)) {
                        Some(line) => pending.line = line,
                        None => parsed
                            .warnings
                            .push("argument to -line should be a number".to_string()),
                    }
                    continue;
                }
                _ => {}
            }
            if let Some(value) = item.strip_prefix(b"+") {
                match parse_line(&String::from_utf8_lossy(value)) {
                    Some(line) => pending.line = line,
                    None => parsed
                        .warnings
                        .push("argument to + should be a number".to_string()),
                }
                continue;
            }
            if item.starts_with(b"-") {
                return Err(ItemsError::UnknownOption(lossy(item)));
            }
        }

        let path = normalize_path(item, cwd).map_err(|source| ItemsError::InvalidPath {
            path: lossy(item),
            source,
        })?;
        let tab_placement = pending.placement_for_next_file();
        records.push(RequestRecord {
            line: pending.line,
            read_only: pending.read_only,
            suppress_create_warning: pending.create,
            iconic: pending.iconic,
            tab_placement,
            file_path: path.clone(),
            macro_command: std::mem::take(&mut pending.macro_command),
            language_mode: pending.language_mode.clone(),
            geometry: pending.geometry.clone(),
        });
        pending.line = 0;
        if !parsed.request.files.contains(&path) {
            parsed.request.files.push(path);
        }
    }

    if !pending.macro_command.is_empty() || records.is_empty() {
        records.push(RequestRecord {
            iconic: pending.iconic,
            tab_placement: pending.tabbed,
            macro_command: pending.macro_command,
            language_mode: pending.language_mode,
            geometry: pending.geometry,
            ..RequestRecord::default()
        });
    }

    parsed.request.batch = RequestBatch::new(records);
    Ok(parsed)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Leading integer of `value`, like `sscanf("%d")`.
fn parse_line(value: &str) -> Option<i32> {
    let trimmed = value.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(idx, ch)| !(ch.is_ascii_digit() || (*idx == 0 && matches!(ch, '-' | '+'))))
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

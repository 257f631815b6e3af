//! Helpers for interpreting raw filesystem watch events.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::path::{Path, PathBuf};

/// Paths that came into existence with this event: created files and rename
/// destinations. The source side of a rename is excluded.
pub fn arrived_paths(event: &Event) -> &[PathBuf] {
    match event.kind {
        EventKind::Create(_) => &event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => &[],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1..).unwrap_or(&[])
        }
        EventKind::Modify(ModifyKind::Name(_)) => &event.paths,
        _ => &[],
    }
}

pub fn has_file_name(path: &Path, file_name: &str) -> bool {
    path.file_name()
        .map(|name| name == file_name)
        .unwrap_or(false)
}

/// Whether any path carried by the event refers to `file_name`.
pub fn touches_file(event: &Event, file_name: &str) -> bool {
    event.paths.iter().any(|path| has_file_name(path, file_name))
}

//! Persistence collaborators: markers, checklists and collected results.

mod checklist;
mod fs;
mod marker;
mod results;

pub use checklist::{Checklist, ChecklistPatch, ChecklistStore, JsonFileChecklistStore, MemoryChecklistStore};
pub use fs::FsMarkerStore;
pub use marker::{Marker, MarkerKey, MarkerStore, MemoryMarkerStore, read_markers};
pub use results::{MemoryResultStore, ModuleResult, PhaseResults, ResultStore};

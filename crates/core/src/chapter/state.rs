use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::GenerationConfig;
use crate::plan::{Chapter, Plan};
use crate::store::{ChapterStore, StoreError};

use super::run_chapters;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    AwaitingStoryboard,
    Generating,
    ChapterComplete,
    AllComplete,
    Error,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read generation state `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write generation state `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to parse generation state `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to rebuild generation state: {0}")]
    Store(#[from] StoreError),
}

/// Progress through a run: which chapter comes next and the visible text so
/// far. Only the orchestrator moves the cursor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationState {
    /// Index into the run's chapters, not a chapter number.
    pub cursor: usize,
    #[serde(default)]
    pub manuscript: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl GenerationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds progress from chapters already in `store`: the cursor stops at
    /// the first run chapter without an artifact.
    pub fn resume<S: ChapterStore + ?Sized>(
        plan: &Plan,
        config: &GenerationConfig,
        store: &S,
    ) -> Result<Self, StateError> {
        let run = run_chapters(plan, config);
        let mut state = Self::new();
        for chapter in &run {
            let Some(text) = store.chapter(chapter.number)? else {
                break;
            };
            append_chapter(&mut state.manuscript, chapter, &text);
            state.cursor += 1;
        }
        state.phase = match state.cursor {
            0 => Phase::AwaitingStoryboard,
            n if n >= run.len() => Phase::AllComplete,
            _ => Phase::ChapterComplete,
        };
        Ok(state)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, StateError> {
        let data = fs::read_to_string(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default(path: &Path) -> Result<Self, StateError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), StateError> {
        let write_error = |source| StateError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, data).map_err(write_error)
    }
}

/// Appends `Chapter N: Title` and the chapter text to the visible manuscript.
pub fn append_chapter(manuscript: &mut String, chapter: &Chapter, text: &str) {
    if !manuscript.is_empty() {
        manuscript.push_str("\n\n");
    }
    manuscript.push_str(&format!("Chapter {}: {}\n\n", chapter.number, chapter.title));
    manuscript.push_str(text.trim_end());
}

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const CHAPTERS_DIR_NAME: &str = "chapters";
const MANUSCRIPT_FILE_NAME: &str = "manuscript.txt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to read `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("artifact store lock poisoned")]
    Poisoned,
}

/// A finished chapter's text, keyed by chapter number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterArtifact {
    pub number: u32,
    pub text: String,
}

/// Durable storage for chapter artifacts and the assembled manuscript.
///
/// Writing a chapter that already exists overwrites it.
pub trait ChapterStore: Send + Sync {
    fn put_chapter(&self, number: u32, text: &str) -> Result<(), StoreError>;
    fn chapter(&self, number: u32) -> Result<Option<String>, StoreError>;
    /// Every stored chapter, ascending by number.
    fn chapters(&self) -> Result<Vec<ChapterArtifact>, StoreError>;
    fn put_manuscript(&self, text: &str) -> Result<(), StoreError>;
    fn manuscript(&self) -> Result<Option<String>, StoreError>;
}

/// Stores `chapters/chapter_N.txt` and `manuscript.txt` under a root directory.
#[derive(Clone, Debug)]
pub struct FsChapterStore {
    root: PathBuf,
}

impl FsChapterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chapter_path(&self, number: u32) -> PathBuf {
        self.root
            .join(CHAPTERS_DIR_NAME)
            .join(format!("chapter_{number}.txt"))
    }

    pub fn manuscript_path(&self) -> PathBuf {
        self.root.join(MANUSCRIPT_FILE_NAME)
    }
}

impl ChapterStore for FsChapterStore {
    fn put_chapter(&self, number: u32, text: &str) -> Result<(), StoreError> {
        write_file(&self.chapter_path(number), text)
    }

    fn chapter(&self, number: u32) -> Result<Option<String>, StoreError> {
        read_optional(&self.chapter_path(number))
    }

    fn chapters(&self) -> Result<Vec<ChapterArtifact>, StoreError> {
        let dir = self.root.join(CHAPTERS_DIR_NAME);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Read { path: dir, source }),
        };

        let mut numbered = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if let Some(number) = chapter_number_from_path(&path) {
                numbered.insert(number, path);
            }
        }

        let mut artifacts = Vec::with_capacity(numbered.len());
        for (number, path) in numbered {
            let text = fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            artifacts.push(ChapterArtifact { number, text });
        }
        Ok(artifacts)
    }

    fn put_manuscript(&self, text: &str) -> Result<(), StoreError> {
        write_file(&self.manuscript_path(), text)
    }

    fn manuscript(&self) -> Result<Option<String>, StoreError> {
        read_optional(&self.manuscript_path())
    }
}

fn chapter_number_from_path(path: &Path) -> Option<u32> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("chapter_")?
        .parse()
        .ok()
}

fn write_file(path: &Path, text: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, text).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryChapterStore {
    chapters: Mutex<BTreeMap<u32, String>>,
    manuscript: Mutex<Option<String>>,
}

impl MemoryChapterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChapterStore for MemoryChapterStore {
    fn put_chapter(&self, number: u32, text: &str) -> Result<(), StoreError> {
        self.chapters
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(number, text.to_string());
        Ok(())
    }

    fn chapter(&self, number: u32) -> Result<Option<String>, StoreError> {
        Ok(self
            .chapters
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(&number)
            .cloned())
    }

    fn chapters(&self) -> Result<Vec<ChapterArtifact>, StoreError> {
        Ok(self
            .chapters
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .iter()
            .map(|(number, text)| ChapterArtifact {
                number: *number,
                text: text.clone(),
            })
            .collect())
    }

    fn put_manuscript(&self, text: &str) -> Result<(), StoreError> {
        *self.manuscript.lock().map_err(|_| StoreError::Poisoned)? = Some(text.to_string());
        Ok(())
    }

    fn manuscript(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .manuscript
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fs_store_lists_chapters_in_numeric_order() {
        let temp = tempdir().unwrap();
        let store = FsChapterStore::new(temp.path());
        store.put_chapter(10, "ten").unwrap();
        store.put_chapter(2, "two").unwrap();
        store.put_chapter(3, "three").unwrap();
        fs::write(temp.path().join("chapters/notes.md"), "ignored").unwrap();

        let numbers: Vec<u32> = store.chapters().unwrap().iter().map(|a| a.number).collect();
        assert_eq!(numbers, vec![2, 3, 10]);
        assert_eq!(store.chapter(3).unwrap().as_deref(), Some("three"));
        assert!(store.chapter(4).unwrap().is_none());
        assert!(temp.path().join("chapters/chapter_10.txt").exists());
    }

    #[test]
    fn fs_store_overwrites_and_keeps_manuscript() {
        let temp = tempdir().unwrap();
        let store = FsChapterStore::new(temp.path().join("out"));
        assert!(store.chapters().unwrap().is_empty());
        assert!(store.manuscript().unwrap().is_none());

        store.put_chapter(2, "draft").unwrap();
        store.put_chapter(2, "final").unwrap();
        store.put_manuscript("whole book").unwrap();

        assert_eq!(store.chapter(2).unwrap().as_deref(), Some("final"));
        assert_eq!(store.manuscript().unwrap().as_deref(), Some("whole book"));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryChapterStore::new();
        store.put_chapter(5, "five").unwrap();
        store.put_chapter(4, "four").unwrap();
        let artifacts = store.chapters().unwrap();
        assert_eq!(artifacts[0], ChapterArtifact { number: 4, text: "four".into() });
        assert_eq!(artifacts.len(), 2);
    }
}

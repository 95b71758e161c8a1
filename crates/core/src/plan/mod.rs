use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_SECTION_WORDS: u32 = 400;
pub const DEFAULT_INSTRUCTIONS: &str = "Describe in detail.";
pub const DEFAULT_STYLE: &str = "narrative prose";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to parse storyboard: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("storyboard has no chapter list")]
    MissingChapters,
    #[error("storyboard chapter #{index} is malformed: {source}")]
    Malformed {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("storyboard lists chapter {number} more than once")]
    DuplicateChapter { number: u32 },
    #[error("storyboard lists chapter {number} after chapter {previous}; chapters must ascend")]
    OutOfOrder { number: u32, previous: u32 },
    #[error("storyboard has {found} chapters, this mode requires exactly {expected}")]
    ChapterCount { expected: usize, found: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub task: String,
    #[serde(alias = "target_words", alias = "words", default = "default_word_count")]
    pub word_count: u32,
    #[serde(default = "default_instructions")]
    pub instructions: String,
}

impl Section {
    fn normalize(&mut self) {
        if self.word_count == 0 {
            self.word_count = DEFAULT_SECTION_WORDS;
        }
        if self.instructions.trim().is_empty() {
            self.instructions = DEFAULT_INSTRUCTIONS.to_string();
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chapter {
    #[serde(alias = "chapter_number")]
    pub number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Chapter {
    pub fn style_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.style
            .as_deref()
            .map(str::trim)
            .filter(|style| !style.is_empty())
            .unwrap_or(fallback)
    }

}

/// A storyboard: chapters in ascending number order plus global notes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    #[serde(alias = "style", default = "default_style")]
    pub default_style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub chapters: Vec<Chapter>,
}

impl Plan {
    pub fn from_json_str(input: &str) -> Result<Self, PlanError> {
        if input.trim().is_empty() {
            return Err(PlanError::MissingChapters);
        }
        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> Result<Self, PlanError> {
        let entries = match value.get_mut("chapters").map(Value::take) {
            Some(Value::Array(entries)) => entries,
            _ => return Err(PlanError::MissingChapters),
        };

        let default_style = value
            .get("default_style")
            .or_else(|| value.get("style"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|style| !style.is_empty())
            .unwrap_or(DEFAULT_STYLE)
            .to_string();
        let notes = value
            .get("notes")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|notes| !notes.is_empty())
            .map(str::to_string);

        let mut chapters = Vec::with_capacity(entries.len());
        let mut previous: Option<u32> = None;
        for (index, entry) in entries.into_iter().enumerate() {
            let mut chapter: Chapter = serde_json::from_value(entry)
                .map_err(|source| PlanError::Malformed { index, source })?;
            match previous {
                Some(prev) if prev == chapter.number => {
                    return Err(PlanError::DuplicateChapter {
                        number: chapter.number,
                    });
                }
                Some(prev) if prev > chapter.number => {
                    return Err(PlanError::OutOfOrder {
                        number: chapter.number,
                        previous: prev,
                    });
                }
                _ => previous = Some(chapter.number),
            }
            for section in &mut chapter.sections {
                section.normalize();
            }
            chapters.push(chapter);
        }

        Ok(Self {
            default_style,
            notes,
            chapters,
        })
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn chapter(&self, number: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|chapter| chapter.number == number)
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn require_chapter_count(&self, expected: usize) -> Result<(), PlanError> {
        if self.chapters.len() == expected {
            Ok(())
        } else {
            Err(PlanError::ChapterCount {
                expected,
                found: self.chapters.len(),
            })
        }
    }

    pub fn style_for<'a>(&'a self, chapter: &'a Chapter) -> &'a str {
        chapter.style_or(&self.default_style)
    }

    pub fn titles(&self) -> Vec<ChapterTitle> {
        self.chapters
            .iter()
            .map(|chapter| ChapterTitle {
                number: chapter.number,
                title: chapter.title.clone(),
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterTitle {
    pub number: u32,
    pub title: String,
}

impl ChapterTitle {
    /// The `--- Chapter N: Title ---` marker used in plain-text storyboards.
    pub fn header(&self) -> String {
        format!("--- Chapter {}: {} ---", self.number, self.title)
    }
}

impl fmt::Display for ChapterTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chapter {}: {}", self.number, self.title)
    }
}

/// Recovers chapter titles from `--- Chapter N: Title ---` markers, in the
/// order they appear.
pub fn recover_titles(text: &str) -> Vec<ChapterTitle> {
    text.lines()
        .filter_map(|line| header_regex().captures(line.trim()))
        .filter_map(|caps| {
            let number = caps.get(1)?.as_str().parse().ok()?;
            let title = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            Some(ChapterTitle { number, title })
        })
        .collect()
}

fn header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^-{3,}\s*Chapter\s+(\d+)\s*:\s*(.*?)\s*-{3,}$")
            .expect("invalid chapter marker regex")
    })
}

fn default_word_count() -> u32 {
    DEFAULT_SECTION_WORDS
}

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

fn default_style() -> String {
    DEFAULT_STYLE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "default_style": "gothic, slow-burning",
        "chapters": [
            {
                "number": 2,
                "title": "The Lighthouse",
                "setting": "A storm-beaten coast",
                "characters": ["Mara", "Tomas"],
                "sections": [
                    {"task": "Mara arrives", "word_count": 600, "instructions": "Open on the sea."},
                    {"task": "Tomas warns her"}
                ]
            },
            {
                "chapter_number": 3,
                "title": "Low Tide",
                "style": "terse",
                "sections": [{"task": "A body on the sand", "target_words": 0, "instructions": "  "}]
            }
        ]
    }"#;

    #[test]
    fn parses_chapters_with_defaults() {
        let plan = Plan::from_json_str(PLAN).unwrap();
        assert_eq!(plan.len(), 2);

        let first = plan.chapter(2).unwrap();
        assert_eq!(first.characters, vec!["Mara", "Tomas"]);
        assert_eq!(first.sections[1].word_count, DEFAULT_SECTION_WORDS);
        assert_eq!(first.sections[1].instructions, DEFAULT_INSTRUCTIONS);
        assert_eq!(plan.style_for(first), "gothic, slow-burning");

        let second = plan.chapter(3).unwrap();
        assert_eq!(plan.style_for(second), "terse");
        assert_eq!(second.sections[0].word_count, DEFAULT_SECTION_WORDS);
        assert_eq!(second.sections[0].instructions, DEFAULT_INSTRUCTIONS);
    }

    #[test]
    fn missing_chapter_list_is_reported() {
        assert!(matches!(
            Plan::from_json_str(r#"{"title": "no chapters"}"#),
            Err(PlanError::MissingChapters)
        ));
        assert!(matches!(
            Plan::from_json_str(r#"{"chapters": "soon"}"#),
            Err(PlanError::MissingChapters)
        ));
        assert!(matches!(
            Plan::from_json_str(""),
            Err(PlanError::MissingChapters)
        ));
    }

    #[test]
    fn duplicate_numbers_are_rejected() {
        let err = Plan::from_json_str(
            r#"{"chapters": [{"number": 4, "sections": []}, {"number": 4, "sections": []}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateChapter { number: 4 }));
    }

    #[test]
    fn descending_numbers_are_rejected() {
        let err = Plan::from_json_str(
            r#"{"chapters": [{"number": 3, "sections": []}, {"number": 2, "sections": []}]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PlanError::OutOfOrder {
                number: 2,
                previous: 3
            }
        ));
    }

    #[test]
    fn chapter_count_requirement() {
        let plan = Plan::from_json_str(PLAN).unwrap();
        assert!(plan.require_chapter_count(2).is_ok());
        match plan.require_chapter_count(9) {
            Err(PlanError::ChapterCount { expected, found }) => {
                assert_eq!((expected, found), (9, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn recovers_titles_from_markers() {
        let text = "Intro line\n--- Chapter 2: The Lighthouse ---\nbody\n---  Chapter 3:Low Tide ---\n";
        let titles = recover_titles(text);
        assert_eq!(
            titles,
            vec![
                ChapterTitle {
                    number: 2,
                    title: "The Lighthouse".into()
                },
                ChapterTitle {
                    number: 3,
                    title: "Low Tide".into()
                },
            ]
        );
        assert_eq!(titles[0].header(), "--- Chapter 2: The Lighthouse ---");
    }
}

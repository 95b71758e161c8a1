//! Post-processing for flat generated text: line-by-line language
//! normalization and realignment of chapter headers onto a storyboard.

use thiserror::Error;

use crate::generation::{GenerationError, GenerationRequest, SamplingParams, TextGenerator};
use crate::plan::ChapterTitle;
use crate::prompts::{PromptError, PromptRegistry};

pub const EXCESS_TAG: &str = "[EXCESS - REVIEW]";

#[derive(Debug, Error)]
pub enum FixerError {
    #[error("language detection failed: {0}")]
    Detection(String),
    #[error("translation prompt failed: {0}")]
    Prompt(#[from] PromptError),
    #[error("translation failed: {0}")]
    Translation(#[from] GenerationError),
    #[error("translation came back empty")]
    EmptyTranslation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    English,
    Foreign,
}

pub trait LanguageDetector {
    fn detect(&self, line: &str) -> Result<Detection, FixerError>;
}

pub trait Translator {
    fn translate(&self, line: &str) -> Result<String, FixerError>;
}

const ENGLISH_MARKERS: &[&str] = &[
    "the", "and", "of", "to", "a", "in", "is", "was", "he", "she", "it", "that", "with", "for",
    "his", "her", "on", "at", "as", "had", "but", "they", "you", "i", "not", "from", "were",
    "be", "this", "by", "an", "we", "are", "have", "their",
];

const FOREIGN_MARKERS: &[&str] = &[
    "el", "la", "los", "las", "que", "y", "en", "un", "una", "es", "por", "con", "para", "pero",
    "não", "uma", "os", "ao", "mas", "le", "les", "et", "des", "du", "est", "une", "dans", "pas",
    "qui", "je", "il", "elle", "avec", "der", "die", "das", "und", "ist", "nicht", "ein", "eine",
    "ich", "mit", "sie", "zu", "auf", "di", "che", "non", "sono", "gli", "della",
];

/// Heuristic detector: dominant script first, then English function words
/// against common function words of other Latin-script languages.
#[derive(Clone, Copy, Debug)]
pub struct ScriptDetector {
    /// Share of letters outside the Latin script that marks a line foreign.
    pub non_latin_ratio: f64,
}

impl Default for ScriptDetector {
    fn default() -> Self {
        Self {
            non_latin_ratio: 0.3,
        }
    }
}

impl LanguageDetector for ScriptDetector {
    fn detect(&self, line: &str) -> Result<Detection, FixerError> {
        let mut letters = 0usize;
        let mut non_latin = 0usize;
        for ch in line.chars().filter(|ch| ch.is_alphabetic()) {
            letters += 1;
            if !is_latin(ch) {
                non_latin += 1;
            }
        }
        if letters == 0 {
            return Ok(Detection::English);
        }
        if non_latin as f64 / letters as f64 > self.non_latin_ratio {
            return Ok(Detection::Foreign);
        }

        let mut english = 0usize;
        let mut foreign = 0usize;
        for word in line.split_whitespace() {
            let word = word
                .trim_matches(|ch: char| !ch.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            if ENGLISH_MARKERS.contains(&word.as_str()) {
                english += 1;
            } else if FOREIGN_MARKERS.contains(&word.as_str()) {
                foreign += 1;
            }
        }
        Ok(if foreign > english {
            Detection::Foreign
        } else {
            Detection::English
        })
    }
}

fn is_latin(ch: char) -> bool {
    ch.is_ascii_alphabetic() || matches!(ch, '\u{00C0}'..='\u{024F}' | '\u{1E00}'..='\u{1EFF}')
}

/// Translates one line at a time through any text backend.
pub struct ModelTranslator<'a, G: TextGenerator + ?Sized> {
    generator: &'a G,
    prompts: &'a PromptRegistry,
    sampling: SamplingParams,
}

impl<'a, G: TextGenerator + ?Sized> ModelTranslator<'a, G> {
    pub fn new(generator: &'a G, prompts: &'a PromptRegistry) -> Self {
        Self {
            generator,
            prompts,
            sampling: SamplingParams {
                temperature: 0.2,
                ..SamplingParams::default()
            },
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

impl<G: TextGenerator + ?Sized> Translator for ModelTranslator<'_, G> {
    fn translate(&self, line: &str) -> Result<String, FixerError> {
        let prompt = self.prompts.format_with("translate_line", [("line", line)])?;
        let output = self
            .generator
            .generate(&GenerationRequest::new(prompt, self.sampling))?;
        let translated = output.trim();
        if translated.is_empty() {
            return Err(FixerError::EmptyTranslation);
        }
        Ok(translated.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub text: String,
    pub translated_lines: usize,
    /// Lines kept as-is because detection or translation failed.
    pub failed_lines: usize,
}

/// Replaces every non-empty line detected as non-English with its translation.
/// Any failure leaves the line untouched.
pub fn normalize_language(
    text: &str,
    detector: &dyn LanguageDetector,
    translator: &dyn Translator,
) -> NormalizeReport {
    let mut report = NormalizeReport::default();
    let mut lines = Vec::new();

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            lines.push(line.to_string());
            continue;
        }

        let detection = match detector.detect(line) {
            Ok(detection) => detection,
            Err(err) => {
                log::warn!("line {}: {err}; keeping original", index + 1);
                report.failed_lines += 1;
                lines.push(line.to_string());
                continue;
            }
        };
        if detection == Detection::English {
            lines.push(line.to_string());
            continue;
        }

        match translator.translate(line) {
            Ok(translated) => {
                log::debug!("line {}: translated", index + 1);
                report.translated_lines += 1;
                lines.push(translated);
            }
            Err(err) => {
                log::warn!("line {}: {err}; keeping original", index + 1);
                report.failed_lines += 1;
                lines.push(line.to_string());
            }
        }
    }

    report.text = lines.join("\n");
    if text.ends_with('\n') {
        report.text.push('\n');
    }
    report
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RealignReport {
    pub text: String,
    pub headers_rewritten: usize,
    pub excess_lines: usize,
}

/// Rewrites the first `titles.len()` lines containing "Chapter" into
/// `--- Chapter N: Title ---` headers, in order. Once every title is used, each
/// further non-empty line is tagged for review.
pub fn realign(text: &str, titles: &[ChapterTitle]) -> RealignReport {
    let mut report = RealignReport::default();
    let mut remaining = titles.iter();
    let mut next = remaining.next();
    let mut lines = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            lines.push(line.to_string());
            continue;
        }
        match next {
            Some(title) if line.contains("Chapter") => {
                lines.push(title.header());
                report.headers_rewritten += 1;
                next = remaining.next();
            }
            Some(_) => lines.push(line.to_string()),
            None => {
                lines.push(format!("{EXCESS_TAG} {line}"));
                report.excess_lines += 1;
            }
        }
    }

    if report.excess_lines > 0 {
        log::warn!(
            "{} line(s) past the last storyboard chapter tagged for review",
            report.excess_lines
        );
    }

    report.text = lines.join("\n");
    if text.ends_with('\n') {
        report.text.push('\n');
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TableTranslator(HashMap<&'static str, &'static str>);

    impl Translator for TableTranslator {
        fn translate(&self, line: &str) -> Result<String, FixerError> {
            self.0
                .get(line)
                .map(|t| t.to_string())
                .ok_or(FixerError::EmptyTranslation)
        }
    }

    struct BrokenDetector;

    impl LanguageDetector for BrokenDetector {
        fn detect(&self, _line: &str) -> Result<Detection, FixerError> {
            Err(FixerError::Detection("model unavailable".into()))
        }
    }

    fn titles(n: u32) -> Vec<ChapterTitle> {
        (1..=n)
            .map(|number| ChapterTitle {
                number,
                title: format!("Part {number}"),
            })
            .collect()
    }

    #[test]
    fn detector_separates_scripts_and_function_words() {
        let detector = ScriptDetector::default();
        let detect = |line| detector.detect(line).unwrap();
        assert_eq!(detect("She walked to the edge of the cliff."), Detection::English);
        assert_eq!(detect("他走到了悬崖边。"), Detection::Foreign);
        assert_eq!(detect("Она подошла к краю обрыва."), Detection::Foreign);
        assert_eq!(detect("Ella caminó hasta el borde y la miró."), Detection::Foreign);
        assert_eq!(detect("Mara!"), Detection::English);
        assert_eq!(detect("*** 42 ***"), Detection::English);
    }

    #[test]
    fn foreign_lines_are_translated_in_place() {
        let translator = TableTranslator(HashMap::from([(
            "他走到了悬崖边。",
            "He walked to the edge of the cliff.",
        )]));
        let text = "The wind rose.\n\n他走到了悬崖边。\nНичего.\n";
        let report = normalize_language(text, &ScriptDetector::default(), &translator);
        assert_eq!(
            report.text,
            "The wind rose.\n\nHe walked to the edge of the cliff.\nНичего.\n"
        );
        assert_eq!(report.translated_lines, 1);
        assert_eq!(report.failed_lines, 1);
    }

    #[test]
    fn detection_failures_pass_lines_through() {
        let translator = TableTranslator(HashMap::new());
        let report = normalize_language("uno\ndos", &BrokenDetector, &translator);
        assert_eq!(report.text, "uno\ndos");
        assert_eq!(report.failed_lines, 2);
    }

    #[test]
    fn realign_rewrites_headers_then_tags_excess() {
        let text = "Chapter One\nopening\n\nChapter Two\nmiddle\nChapter Three\nextra\n";
        let report = realign(text, &titles(2));
        assert_eq!(report.headers_rewritten, 2);
        assert_eq!(report.excess_lines, 3);
        assert_eq!(
            report.text,
            "--- Chapter 1: Part 1 ---\nopening\n\n--- Chapter 2: Part 2 ---\n\
             [EXCESS - REVIEW] middle\n\
             [EXCESS - REVIEW] Chapter Three\n\
             [EXCESS - REVIEW] extra\n"
        );
    }

    #[test]
    fn realign_with_fewer_headers_than_titles_tags_nothing() {
        let report = realign("Chapter A\nbody", &titles(3));
        assert_eq!(report.headers_rewritten, 1);
        assert_eq!(report.excess_lines, 0);
        assert_eq!(report.text, "--- Chapter 1: Part 1 ---\nbody");
    }
}

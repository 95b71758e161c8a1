//! Second pass over a finished manuscript: every section is regenerated at a
//! multiple of its planned length and every unit is forced into a word band
//! around its new target.

use thiserror::Error;

use crate::chapter::{append_chapter, character_list, error_placeholder};
use crate::config::{EnhancementConfig, GenerationConfig};
use crate::generation::{GenerationRequest, SamplingParams, TextGenerator};
use crate::logging::{LogLevel, LogRecord, LogSink, Scope};
use crate::plan::{Chapter, Plan, PlanError, Section};
use crate::prompts::{PromptError, PromptRegistry};
use crate::store::{ChapterStore, StoreError};
use crate::text::{correct_to_band, count_words, Band, BandCorrection};

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("storyboard cannot be enhanced: {0}")]
    Plan(#[from] PlanError),
    #[error("failed to render enhancement prompt for chapter {chapter}, section {section}: {source}")]
    Prompt {
        chapter: u32,
        section: usize,
        #[source]
        source: PromptError,
    },
    #[error("failed to read original chapter {chapter}: {source}")]
    ReadOriginal {
        chapter: u32,
        #[source]
        source: StoreError,
    },
    #[error("failed to store enhanced chapter {chapter}: {source}")]
    StoreChapter {
        chapter: u32,
        #[source]
        source: StoreError,
    },
    #[error("failed to store enhanced manuscript: {0}")]
    StoreManuscript(#[source] StoreError),
}

/// Words in the manuscript outside the `Chapter N: Title` lines the
/// orchestrator writes, so originals and enhanced chapters count alike.
fn body_words(manuscript: &str, plan: &Plan) -> usize {
    let headers: Vec<String> = plan
        .titles()
        .iter()
        .map(|title| title.to_string().trim().to_string())
        .collect();
    manuscript
        .lines()
        .filter(|line| !headers.iter().any(|header| header == line.trim()))
        .map(count_words)
        .sum()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionEnhancement {
    pub band: Band,
    pub word_count: usize,
    pub correction: BandCorrection,
    pub failed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterEnhancement {
    pub number: u32,
    pub original_words: usize,
    /// The original count came from the manuscript average, not an artifact.
    pub estimated: bool,
    pub band: Band,
    pub word_count: usize,
    pub correction: BandCorrection,
    pub sections: Vec<SectionEnhancement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnhanceReport {
    /// Manuscript words, headers excluded.
    pub original_words: usize,
    pub band: Band,
    /// Sum of the enhanced chapter texts, headers excluded.
    pub word_count: usize,
    pub chapters: Vec<ChapterEnhancement>,
}

impl EnhanceReport {
    pub fn within_band(&self) -> bool {
        self.band.contains(self.word_count)
    }
}

pub struct Enhancer<'a> {
    prompts: &'a PromptRegistry,
    config: &'a EnhancementConfig,
    generation: &'a GenerationConfig,
    sink: &'a dyn LogSink,
    sampling: SamplingParams,
}

impl<'a> Enhancer<'a> {
    pub fn new(
        prompts: &'a PromptRegistry,
        config: &'a EnhancementConfig,
        generation: &'a GenerationConfig,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            prompts,
            config,
            generation,
            sink,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn enhance<G, O, E>(
        &self,
        plan: &Plan,
        manuscript: &str,
        originals: &O,
        generator: &G,
        enhanced: &E,
    ) -> Result<EnhanceReport, EnhanceError>
    where
        G: TextGenerator + ?Sized,
        O: ChapterStore + ?Sized,
        E: ChapterStore + ?Sized,
    {
        plan.require_chapter_count(self.config.expected_chapters)?;

        let factor = self.config.factor as usize;
        let original_words = body_words(manuscript, plan);
        let band = Band::around(original_words * factor, self.config.tolerance);
        let fallback_words = original_words / self.config.expected_chapters.max(1);
        let plan_json = plan.to_json_pretty();
        self.log(
            Scope::stage("enhance"),
            LogLevel::Info,
            format!(
                "enhancing {original_words} words toward {} ({}..={})",
                band.target, band.lower, band.upper
            ),
        );

        let mut previous = manuscript.to_string();
        let mut enhanced_manuscript = String::new();
        let mut chapters = Vec::with_capacity(plan.len());
        let mut total_words = 0usize;

        for chapter in plan.chapters() {
            let original = originals
                .chapter(chapter.number)
                .map_err(|source| EnhanceError::ReadOriginal {
                    chapter: chapter.number,
                    source,
                })?;
            let stored_words = original.as_deref().map(count_words).filter(|words| *words > 0);
            let (chapter_original, estimated) = match stored_words {
                Some(words) => (words, false),
                None => {
                    self.log(
                        Scope::stage("enhance").chapter(chapter.number),
                        LogLevel::Warn,
                        format!("no usable stored original; assuming {fallback_words} words"),
                    );
                    (fallback_words, true)
                }
            };
            let chapter_band = Band::around(chapter_original * factor, self.config.tolerance);

            let mut section_texts = Vec::with_capacity(chapter.sections.len());
            let mut sections = Vec::with_capacity(chapter.sections.len());
            for (index, section) in chapter.sections.iter().enumerate() {
                let (text, outcome) = self.enhance_section(
                    plan, &plan_json, manuscript, &previous, chapter, index, section, generator,
                )?;
                section_texts.push(text);
                sections.push(outcome);
            }

            let joined = section_texts.join("\n\n");
            let (text, correction) =
                correct_to_band(&joined, chapter_band, &self.config.filler_phrase);
            let word_count = count_words(&text);

            enhanced
                .put_chapter(chapter.number, &text)
                .map_err(|source| EnhanceError::StoreChapter {
                    chapter: chapter.number,
                    source,
                })?;
            self.log(
                Scope::stage("enhance").chapter(chapter.number),
                LogLevel::Info,
                format!(
                    "chapter stored: {word_count} words (band {}..={}, {correction:?})",
                    chapter_band.lower, chapter_band.upper
                ),
            );

            append_chapter(&mut enhanced_manuscript, chapter, &text);
            total_words += word_count;
            chapters.push(ChapterEnhancement {
                number: chapter.number,
                original_words: chapter_original,
                estimated,
                band: chapter_band,
                word_count,
                correction,
                sections,
            });
            previous = text;
        }

        enhanced
            .put_manuscript(&enhanced_manuscript)
            .map_err(EnhanceError::StoreManuscript)?;

        let report = EnhanceReport {
            original_words,
            band,
            word_count: total_words,
            chapters,
        };
        let level = if report.within_band() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        self.log(
            Scope::stage("enhance"),
            level,
            format!(
                "enhanced manuscript: {} words against band {}..={}",
                report.word_count, band.lower, band.upper
            ),
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn enhance_section<G: TextGenerator + ?Sized>(
        &self,
        plan: &Plan,
        plan_json: &str,
        manuscript: &str,
        previous: &str,
        chapter: &Chapter,
        index: usize,
        section: &Section,
        generator: &G,
    ) -> Result<(String, SectionEnhancement), EnhanceError> {
        let target = section.word_count as usize * self.config.factor as usize;
        let band = Band::around(target, self.config.tolerance);
        let scope = Scope::stage("enhance").chapter(chapter.number).section(index);

        let prompt = self
            .prompts
            .format_with(
                "enhance_section",
                [
                    ("manuscript", manuscript.to_string()),
                    ("plan", plan_json.to_string()),
                    ("previous_chapter", previous.to_string()),
                    ("number", chapter.number.to_string()),
                    ("title", chapter.title.clone()),
                    ("setting", chapter.setting.clone()),
                    ("characters", character_list(chapter)),
                    ("style", plan.style_for(chapter).to_string()),
                    ("task", section.task.clone()),
                    ("instructions", section.instructions.clone()),
                    ("word_count", target.to_string()),
                ],
            )
            .map_err(|source| EnhanceError::Prompt {
                chapter: chapter.number,
                section: index + 1,
                source,
            })?;

        let sampling = SamplingParams {
            max_tokens: self.generation.token_budget(target),
            ..self.sampling
        };
        let (raw, failed) = match generator.generate(&GenerationRequest::new(prompt, sampling)) {
            Ok(text) => (text, false),
            Err(err) => {
                self.log(
                    scope.clone(),
                    LogLevel::Warn,
                    format!("generation failed: {err}"),
                );
                (error_placeholder(&err.to_string(), target), true)
            }
        };

        let (text, correction) = correct_to_band(&raw, band, &self.config.filler_phrase);
        let word_count = count_words(&text);
        if correction != BandCorrection::Unchanged {
            self.log(
                scope,
                LogLevel::Info,
                format!(
                    "{} words corrected to {word_count} ({correction:?})",
                    count_words(&raw)
                ),
            );
        }

        Ok((
            text,
            SectionEnhancement {
                band,
                word_count,
                correction,
                failed,
            },
        ))
    }

    fn log(&self, scope: Scope, level: LogLevel, message: String) {
        self.sink.log(LogRecord::scoped(level, scope, message));
    }
}

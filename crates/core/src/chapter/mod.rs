use std::fmt;

use crate::config::GenerationConfig;
use crate::generation::{SamplingParams, TextGenerator};
use crate::logging::{LogLevel, LogRecord, LogSink, Scope};
use crate::plan::{Chapter, Plan};
use crate::prompts::{PromptError, PromptRegistry};
use crate::store::{ChapterStore, StoreError};
use crate::text::{count_words, pad_to};

mod length;
mod prompt;
mod state;

pub use length::{error_placeholder, LengthEnforcer, SectionResult};
pub use prompt::{
    character_list, render_payload, Payloads, PromptCompiler, SectionContext, Shortfall,
};
pub use state::{append_chapter, GenerationState, Phase, StateError};

const NO_STORYBOARD: &str = "no valid storyboard";
const SECTION_SEPARATOR: &str = "\n\n";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterStage {
    Context,
    Prompt,
    Length,
    Persist,
    Assemble,
}

impl ChapterStage {
    fn label(&self) -> &'static str {
        match self {
            Self::Context => "continuity context",
            Self::Prompt => "prompt compilation",
            Self::Length => "length enforcement",
            Self::Persist => "chapter persistence",
            Self::Assemble => "manuscript assembly",
        }
    }
}

impl fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
enum ChapterError {
    #[error("{stage} failed for chapter {chapter}: {source}")]
    Store {
        stage: ChapterStage,
        chapter: u32,
        #[source]
        source: StoreError,
    },
    #[error("{stage} failed for chapter {chapter}, section {section}: {source}")]
    Prompt {
        stage: ChapterStage,
        chapter: u32,
        section: usize,
        #[source]
        source: PromptError,
    },
}

/// What one finished chapter looked like.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterReport {
    pub number: u32,
    pub title: String,
    pub word_count: usize,
    pub sections: Vec<SectionResult>,
    /// Filler sentences appended to reach the chapter floor.
    pub floor_padding: usize,
}

impl ChapterReport {
    pub fn padded_sections(&self) -> usize {
        self.sections.iter().filter(|s| s.padded).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    ChapterComplete(ChapterReport),
    /// `finished` carries the chapter completed by this step, if any.
    AllComplete {
        chapters: usize,
        word_count: usize,
        finished: Option<ChapterReport>,
    },
    Error(String),
}

impl StepOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            Self::ChapterComplete(_) => Phase::ChapterComplete,
            Self::AllComplete { .. } => Phase::AllComplete,
            Self::Error(_) => Phase::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ChapterComplete(_))
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChapterComplete(report) => write!(
                f,
                "chapter {} \"{}\" complete: {} words",
                report.number, report.title, report.word_count
            ),
            Self::AllComplete {
                chapters,
                word_count,
                ..
            } => write!(f, "all {chapters} chapters complete: {word_count} words"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// The chapters a run covers: those numbered inside the configured span, in
/// ascending order.
pub fn run_chapters<'p>(plan: &'p Plan, config: &GenerationConfig) -> Vec<&'p Chapter> {
    let span = config.chapter_span();
    plan.chapters()
        .iter()
        .filter(|chapter| span.contains(&chapter.number))
        .collect()
}

pub struct ChapterOrchestrator<'a> {
    prompts: &'a PromptRegistry,
    config: &'a GenerationConfig,
    sink: &'a dyn LogSink,
    payloads: Payloads,
    sampling: SamplingParams,
}

impl<'a> ChapterOrchestrator<'a> {
    pub fn new(
        prompts: &'a PromptRegistry,
        config: &'a GenerationConfig,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            prompts,
            config,
            sink,
            payloads: Payloads::default(),
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_payloads(mut self, payloads: Payloads) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Back to the first chapter with an empty manuscript. Stored artifacts
    /// are left alone.
    pub fn reset(&self, state: &mut GenerationState) {
        *state = GenerationState::new();
        self.log(
            Scope::stage("orchestrator"),
            LogLevel::Info,
            "generation state reset",
        );
    }

    /// Generates the chapter under the cursor, or reports completion.
    pub fn step<G, S>(
        &self,
        state: &mut GenerationState,
        plan: Option<&Plan>,
        generator: &G,
        store: &S,
    ) -> StepOutcome
    where
        G: TextGenerator + ?Sized,
        S: ChapterStore + ?Sized,
    {
        let Some(plan) = plan.filter(|plan| !plan.is_empty()) else {
            return self.fail(state, NO_STORYBOARD.to_string());
        };
        let run = run_chapters(plan, self.config);
        if run.is_empty() {
            let span = self.config.chapter_span();
            return self.fail(
                state,
                format!(
                    "{NO_STORYBOARD}: no chapters numbered {}..={}",
                    span.start(),
                    span.end()
                ),
            );
        }

        if state.cursor >= run.len() {
            state.phase = Phase::AllComplete;
            return StepOutcome::AllComplete {
                chapters: run.len(),
                word_count: count_words(&state.manuscript),
                finished: None,
            };
        }

        let chapter = run[state.cursor];
        state.phase = Phase::Generating;
        self.log(
            Scope::stage("orchestrator").chapter(chapter.number),
            LogLevel::Info,
            format!(
                "generating chapter {} of {}: {}",
                state.cursor + 1,
                run.len(),
                chapter.title
            ),
        );

        let (report, text) = match self.generate_chapter(plan, chapter, generator, store) {
            Ok(generated) => generated,
            Err(err) => return self.fail(state, err.to_string()),
        };

        let mut manuscript = state.manuscript.clone();
        append_chapter(&mut manuscript, chapter, &text);

        let is_last = state.cursor + 1 == run.len();
        if is_last {
            if let Err(source) = store.put_manuscript(&manuscript) {
                let err = ChapterError::Store {
                    stage: ChapterStage::Assemble,
                    chapter: chapter.number,
                    source,
                };
                return self.fail(state, err.to_string());
            }
        }

        state.manuscript = manuscript;
        state.cursor += 1;
        state.last_error = None;
        self.log(
            Scope::stage("orchestrator").chapter(chapter.number),
            LogLevel::Info,
            format!(
                "chapter {} stored with {} words ({} padded section(s))",
                report.number,
                report.word_count,
                report.padded_sections()
            ),
        );

        if is_last {
            state.phase = Phase::AllComplete;
            StepOutcome::AllComplete {
                chapters: run.len(),
                word_count: count_words(&state.manuscript),
                finished: Some(report),
            }
        } else {
            state.phase = Phase::ChapterComplete;
            StepOutcome::ChapterComplete(report)
        }
    }

    /// Steps until the run completes or fails. Returns every outcome in order.
    pub fn run_to_completion<G, S>(
        &self,
        state: &mut GenerationState,
        plan: Option<&Plan>,
        generator: &G,
        store: &S,
    ) -> Vec<StepOutcome>
    where
        G: TextGenerator + ?Sized,
        S: ChapterStore + ?Sized,
    {
        let mut outcomes = Vec::new();
        loop {
            let outcome = self.step(state, plan, generator, store);
            let done = outcome.is_terminal();
            outcomes.push(outcome);
            if done {
                return outcomes;
            }
        }
    }

    fn generate_chapter<G, S>(
        &self,
        plan: &Plan,
        chapter: &Chapter,
        generator: &G,
        store: &S,
    ) -> Result<(ChapterReport, String), ChapterError>
    where
        G: TextGenerator + ?Sized,
        S: ChapterStore + ?Sized,
    {
        let store_error = |stage, source| ChapterError::Store {
            stage,
            chapter: chapter.number,
            source,
        };

        let prior = store
            .chapters()
            .map_err(|source| store_error(ChapterStage::Context, source))?
            .into_iter()
            .filter(|artifact| artifact.number < chapter.number)
            .map(|artifact| artifact.text)
            .collect::<Vec<_>>()
            .join(SECTION_SEPARATOR);

        let compiler = PromptCompiler::new(self.prompts);
        let enforcer =
            LengthEnforcer::new(&compiler, self.config, self.sink).with_sampling(self.sampling);
        let context = SectionContext {
            prior: &prior,
            payloads: &self.payloads,
        };

        let mut sections = Vec::with_capacity(chapter.sections.len());
        for (index, section) in chapter.sections.iter().enumerate() {
            let prompt_error = |stage, source| ChapterError::Prompt {
                stage,
                chapter: chapter.number,
                section: index + 1,
                source,
            };
            let base = compiler
                .section_prompt(plan, chapter, section, &context)
                .map_err(|source| prompt_error(ChapterStage::Prompt, source))?;
            let scope = Scope::stage("length")
                .chapter(chapter.number)
                .section(index);
            let result = enforcer
                .enforce_in(&scope, generator, &base, section.word_count as usize)
                .map_err(|source| prompt_error(ChapterStage::Length, source))?;
            sections.push(result);
        }

        let mut text = sections
            .iter()
            .map(|result| result.text.trim())
            .collect::<Vec<_>>()
            .join(SECTION_SEPARATOR);
        let floor_padding = pad_to(
            &mut text,
            self.config.chapter_floor_words,
            &self.config.filler_sentence,
        );
        if floor_padding > 0 {
            self.log(
                Scope::stage("orchestrator").chapter(chapter.number),
                LogLevel::Warn,
                format!(
                    "chapter below {} words; appended {floor_padding} filler sentence(s)",
                    self.config.chapter_floor_words
                ),
            );
        }

        store
            .put_chapter(chapter.number, &text)
            .map_err(|source| store_error(ChapterStage::Persist, source))?;

        let report = ChapterReport {
            number: chapter.number,
            title: chapter.title.clone(),
            word_count: count_words(&text),
            sections,
            floor_padding,
        };
        Ok((report, text))
    }

    fn fail(&self, state: &mut GenerationState, message: String) -> StepOutcome {
        state.phase = Phase::Error;
        state.last_error = Some(message.clone());
        self.log(Scope::stage("orchestrator"), LogLevel::Error, message.clone());
        StepOutcome::Error(message)
    }

    fn log(&self, scope: Scope, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::scoped(level, scope, message));
    }
}

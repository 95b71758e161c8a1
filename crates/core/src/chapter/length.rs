use crate::config::GenerationConfig;
use crate::generation::{GenerationRequest, SamplingParams, TextGenerator};
use crate::logging::{LogLevel, LogRecord, LogSink, Scope};
use crate::prompts::PromptError;
use crate::text::{count_words, ends_with_terminal, force_terminal, pad_to};

use super::prompt::{PromptCompiler, Shortfall};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionResult {
    pub text: String,
    pub word_count: usize,
    /// The backend produced acceptable text on its own.
    pub complete: bool,
    pub attempts: u32,
    /// Terminal punctuation or filler was added after the attempts ran out.
    pub padded: bool,
    pub failed_attempts: u32,
}

/// Text standing in for a failed generation, repeated until it is `target`
/// words long so downstream length checks still hold.
pub fn error_placeholder(cause: &str, target: usize) -> String {
    let cause = cause.split_whitespace().collect::<Vec<_>>().join(" ");
    let unit = format!("[Generation failed: {cause}]");
    let unit_words = count_words(&unit).max(1);
    let repeats = target.div_ceil(unit_words).max(1);
    vec![unit; repeats].join(" ")
}

/// Retries and continues a section until it is long enough and ends on a
/// finished sentence, then falls back to padding.
pub struct LengthEnforcer<'a> {
    compiler: &'a PromptCompiler<'a>,
    config: &'a GenerationConfig,
    sink: &'a dyn LogSink,
    sampling: SamplingParams,
}

impl<'a> LengthEnforcer<'a> {
    pub fn new(
        compiler: &'a PromptCompiler<'a>,
        config: &'a GenerationConfig,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            compiler,
            config,
            sink,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn enforce<G: TextGenerator + ?Sized>(
        &self,
        generator: &G,
        base_prompt: &str,
        target: usize,
    ) -> Result<SectionResult, PromptError> {
        self.enforce_in(&Scope::stage("length"), generator, base_prompt, target)
    }

    pub fn enforce_in<G: TextGenerator + ?Sized>(
        &self,
        scope: &Scope,
        generator: &G,
        base_prompt: &str,
        target: usize,
    ) -> Result<SectionResult, PromptError> {
        let max_attempts = self.config.max_attempts.max(1);
        let sampling = SamplingParams {
            max_tokens: self.config.token_budget(target),
            ..self.sampling
        };

        let mut text = String::new();
        // False while `text` holds nothing or an error placeholder. While true,
        // the next reply is appended to `text`.
        let mut continuable = false;
        let mut failed_attempts = 0u32;

        for attempt in 1..=max_attempts {
            let prompt = if continuable {
                let shortfall = shortfall_of(&text, target);
                self.compiler
                    .continuation_prompt(base_prompt, &text, shortfall)?
            } else {
                base_prompt.to_string()
            };

            match generator.generate(&GenerationRequest::new(prompt, sampling)) {
                Ok(output) => {
                    if continuable {
                        extend_draft(&mut text, &output);
                    } else {
                        text = output;
                    }
                    continuable = true;
                    let words = count_words(&text);
                    if words >= target && ends_with_terminal(&text) {
                        self.log(
                            scope,
                            LogLevel::Info,
                            format!("attempt {attempt}: accepted {words}/{target} words"),
                        );
                        return Ok(SectionResult {
                            text,
                            word_count: words,
                            complete: true,
                            attempts: attempt,
                            padded: false,
                            failed_attempts,
                        });
                    }
                    let reason = if words < target {
                        format!("short at {words}/{target} words")
                    } else {
                        "stops mid-sentence".to_string()
                    };
                    self.log(scope, LogLevel::Info, format!("attempt {attempt}: {reason}"));
                }
                Err(err) => {
                    failed_attempts += 1;
                    text = error_placeholder(&err.to_string(), target);
                    continuable = false;
                    self.log(
                        scope,
                        LogLevel::Warn,
                        format!("attempt {attempt}: generation failed: {err}"),
                    );
                }
            }
        }

        let mut padded = false;
        if !ends_with_terminal(&text) {
            force_terminal(&mut text);
            padded = true;
        }
        let repeats = pad_to(&mut text, target, &self.config.filler_sentence);
        if repeats > 0 {
            padded = true;
        }
        let word_count = count_words(&text);
        self.log(
            scope,
            LogLevel::Warn,
            format!(
                "attempts exhausted after {max_attempts}; padded with {repeats} filler sentence(s) to {word_count} words"
            ),
        );

        Ok(SectionResult {
            text,
            word_count,
            complete: false,
            attempts: max_attempts,
            padded,
            failed_attempts,
        })
    }

    fn log(&self, scope: &Scope, level: LogLevel, message: String) {
        self.sink
            .log(LogRecord::scoped(level, scope.clone(), message));
    }
}

/// Continuations carry only the new words; they extend the draft in place.
fn extend_draft(draft: &mut String, continuation: &str) {
    let continuation = continuation.trim();
    if continuation.is_empty() {
        return;
    }
    let kept = draft.trim_end().len();
    draft.truncate(kept);
    if !draft.is_empty() {
        draft.push(' ');
    }
    draft.push_str(continuation);
}

fn shortfall_of(text: &str, target: usize) -> Shortfall {
    let current = count_words(text);
    if current < target {
        Shortfall::Words { current, target }
    } else {
        Shortfall::Incomplete
    }
}

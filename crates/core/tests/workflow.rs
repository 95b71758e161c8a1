use std::collections::VecDeque;
use std::fs;
use std::sync::Mutex;

use book_core::chapter::append_chapter;
use book_core::{
    count_words, realign, recover_titles, BandCorrection, ChapterOrchestrator, ChapterStore,
    EnhanceError, EnhancementConfig, Enhancer, FsChapterStore, GenerationConfig,
    GenerationError, GenerationRequest, GenerationState, LogLevel, MemoryChapterStore, Payloads,
    Phase, Plan, PlanError, PromptRegistry, StepOutcome, StoreError, TextGenerator, VecLogSink,
};
use serde_json::json;
use tempfile::tempdir;

struct MockTextGenerator {
    responses: Mutex<VecDeque<Result<String, String>>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl MockTextGenerator {
    fn new<I, S>(responses: I, fallback: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            fallback: fallback.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn failing_first(self, cause: &str) -> Self {
        self.responses
            .lock()
            .expect("mock mutex poisoned")
            .push_front(Err(cause.to_string()));
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock mutex poisoned").clone()
    }
}

impl TextGenerator for MockTextGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.prompts
            .lock()
            .expect("mock mutex poisoned")
            .push(request.prompt.clone());
        let next = self
            .responses
            .lock()
            .expect("mock mutex poisoned")
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(cause)) => Err(GenerationError::new(cause)),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// A store whose chapter writes always fail.
struct ReadOnlyStore(MemoryChapterStore);

impl ChapterStore for ReadOnlyStore {
    fn put_chapter(&self, _number: u32, _text: &str) -> Result<(), StoreError> {
        Err(StoreError::Write {
            path: "chapters/chapter_2.txt".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }

    fn chapter(&self, number: u32) -> Result<Option<String>, StoreError> {
        self.0.chapter(number)
    }

    fn chapters(&self) -> Result<Vec<book_core::ChapterArtifact>, StoreError> {
        self.0.chapters()
    }

    fn put_manuscript(&self, text: &str) -> Result<(), StoreError> {
        self.0.put_manuscript(text)
    }

    fn manuscript(&self) -> Result<Option<String>, StoreError> {
        self.0.manuscript()
    }
}

fn prose(marker: &str, words: usize) -> String {
    let mut text = marker.to_string();
    for _ in 1..words {
        text.push_str(" tide");
    }
    text.push('.');
    text
}

fn nine_chapter_plan(section_words: u32) -> Plan {
    let chapters: Vec<_> = (2..=10)
        .map(|number| {
            json!({
                "number": number,
                "title": format!("Tide {number}"),
                "setting": "A storm-beaten coast",
                "characters": ["Mara", "Tomas"],
                "sections": [
                    {"task": format!("Events of chapter {number}"), "word_count": section_words}
                ]
            })
        })
        .collect();
    Plan::from_value(json!({ "default_style": "gothic", "chapters": chapters }))
        .expect("valid plan")
}

#[test]
fn full_run_writes_every_chapter_and_the_manuscript() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = FsChapterStore::new(temp.path());
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);

    let replies: Vec<String> = (2..=10)
        .map(|n| prose(&format!("marker-{n}"), 2100))
        .collect();
    let generator = MockTextGenerator::new(replies, "unused.");

    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink).with_payloads(Payloads {
        characters: Payloads::parse_text(r#"{"Mara": "keeper's daughter"}"#),
        ..Payloads::default()
    });
    let mut state = GenerationState::new();
    let outcomes = orchestrator.run_to_completion(&mut state, Some(&plan), &generator, &store);

    assert_eq!(outcomes.len(), 9);
    assert!(outcomes[..8]
        .iter()
        .all(|outcome| matches!(outcome, StepOutcome::ChapterComplete(_))));
    match outcomes.last() {
        Some(StepOutcome::AllComplete {
            chapters, finished, ..
        }) => {
            assert_eq!(*chapters, 9);
            assert_eq!(finished.as_ref().map(|report| report.number), Some(10));
        }
        other => panic!("unexpected final outcome: {other:?}"),
    }
    assert_eq!(state.phase, Phase::AllComplete);
    assert_eq!(state.cursor, 9);

    let artifacts = store.chapters()?;
    assert_eq!(artifacts.len(), 9);
    for artifact in &artifacts {
        assert!(count_words(&artifact.text) >= 2000);
    }
    let manuscript = fs::read_to_string(temp.path().join("manuscript.txt"))?;
    assert_eq!(manuscript, state.manuscript);
    assert!(manuscript.starts_with("Chapter 2: Tide 2\n\nmarker-2"));
    assert!(manuscript.contains("Chapter 10: Tide 10"));

    // Continuity: each prompt carries every earlier chapter and the payload.
    let sent = generator.prompts();
    assert_eq!(sent.len(), 9);
    assert!(!sent[0].contains("marker-"));
    assert!(sent[3].contains("marker-2") && sent[3].contains("marker-4"));
    assert!(!sent[3].contains("marker-5"));
    assert!(sent[8].contains("\"Mara\": \"keeper's daughter\""));

    Ok(())
}

#[test]
fn completed_run_is_idempotent_and_reset_keeps_artifacts() -> Result<(), Box<dyn std::error::Error>>
{
    let store = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);
    let generator = MockTextGenerator::new(Vec::<String>::new(), prose("steady", 2100));
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);

    let mut state = GenerationState::new();
    orchestrator.run_to_completion(&mut state, Some(&plan), &generator, &store);
    let before = store.chapters()?;
    let calls = generator.prompts().len();

    let again = orchestrator.step(&mut state, Some(&plan), &generator, &store);
    assert!(matches!(
        again,
        StepOutcome::AllComplete { finished: None, chapters: 9, .. }
    ));
    assert_eq!(store.chapters()?, before);
    assert_eq!(generator.prompts().len(), calls);

    orchestrator.reset(&mut state);
    assert_eq!(state.cursor, 0);
    assert!(state.manuscript.is_empty());
    assert_eq!(store.chapters()?.len(), 9);

    Ok(())
}

#[test]
fn missing_or_empty_storyboard_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let generator = MockTextGenerator::new(Vec::<String>::new(), "unused.");
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);
    let mut state = GenerationState::new();

    let outcome = orchestrator.step(&mut state, None, &generator, &store);
    assert_eq!(outcome, StepOutcome::Error("no valid storyboard".into()));

    let empty = Plan::from_json_str(r#"{"chapters": []}"#)?;
    let outcome = orchestrator.step(&mut state, Some(&empty), &generator, &store);
    assert_eq!(outcome.phase(), Phase::Error);
    assert_eq!(state.cursor, 0);
    assert!(generator.prompts().is_empty());
    assert_eq!(sink.messages_at(LogLevel::Error).len(), 2);

    Ok(())
}

#[test]
fn short_output_is_padded_to_section_and_chapter_floors() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);
    let generator = MockTextGenerator::new(Vec::<String>::new(), "Hello world.");
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);
    let mut state = GenerationState::new();

    let outcome = orchestrator.step(&mut state, Some(&plan), &generator, &store);
    let StepOutcome::ChapterComplete(report) = outcome else {
        panic!("expected a completed chapter, got {outcome:?}");
    };
    assert_eq!(report.sections[0].attempts, 5);
    assert!(report.sections[0].padded);
    assert!(report.sections[0].word_count >= 400);
    assert!(report.floor_padding > 0);
    assert!(report.word_count >= 2000);

    let text = store.chapter(2)?.expect("chapter 2 stored");
    assert!(text.starts_with("Hello world. "));
    assert!(text.contains(&config.filler_sentence));
    assert_eq!(generator.prompts().len(), 5);

    Ok(())
}

#[test]
fn continuation_completes_a_short_section() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);
    let generator = MockTextGenerator::new(
        [prose("first-draft", 300), prose("carried-on", 150)],
        "unused.",
    );
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);
    let mut state = GenerationState::new();

    let outcome = orchestrator.step(&mut state, Some(&plan), &generator, &store);
    let StepOutcome::ChapterComplete(report) = outcome else {
        panic!("expected a completed chapter, got {outcome:?}");
    };
    let section = &report.sections[0];
    assert_eq!(section.attempts, 2);
    assert!(section.complete);
    assert!(!section.padded);
    assert_eq!(section.word_count, 450);
    assert!(report.floor_padding > 0);

    let text = store.chapter(2)?.expect("chapter 2 stored");
    assert!(text.starts_with("first-draft tide"));
    assert!(text.contains("tide. carried-on tide"));

    let sent = generator.prompts();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].contains("first-draft tide"));

    Ok(())
}

#[test]
fn backend_failure_is_retried_within_the_section() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);
    let generator =
        MockTextGenerator::new(Vec::<String>::new(), prose("recovered", 2100)).failing_first("timed out");
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);
    let mut state = GenerationState::new();

    let outcome = orchestrator.step(&mut state, Some(&plan), &generator, &store);
    let StepOutcome::ChapterComplete(report) = outcome else {
        panic!("expected a completed chapter, got {outcome:?}");
    };
    assert_eq!(report.sections[0].failed_attempts, 1);
    assert_eq!(report.sections[0].attempts, 2);
    assert!(!store.chapter(2)?.unwrap_or_default().contains("Generation failed"));
    assert!(sink
        .messages_at(LogLevel::Warn)
        .iter()
        .any(|message| message.contains("timed out")));

    Ok(())
}

#[test]
fn storage_failure_reports_error_without_advancing() -> Result<(), Box<dyn std::error::Error>> {
    let store = ReadOnlyStore(MemoryChapterStore::new());
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);
    let generator = MockTextGenerator::new(Vec::<String>::new(), prose("lost", 2100));
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);
    let mut state = GenerationState::new();

    let outcome = orchestrator.step(&mut state, Some(&plan), &generator, &store);
    match &outcome {
        StepOutcome::Error(message) => {
            assert!(message.contains("chapter persistence"));
            assert!(message.contains("chapter 2"));
        }
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(state.cursor, 0);
    assert_eq!(state.phase, Phase::Error);
    assert!(state.manuscript.is_empty());

    Ok(())
}

#[test]
fn interrupted_run_resumes_from_stored_chapters() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(400);
    let generator = MockTextGenerator::new(Vec::<String>::new(), prose("again", 2100));
    let orchestrator = ChapterOrchestrator::new(&prompts, &config, &sink);

    let mut state = GenerationState::new();
    orchestrator.step(&mut state, Some(&plan), &generator, &store);
    orchestrator.step(&mut state, Some(&plan), &generator, &store);

    let resumed = GenerationState::resume(&plan, &config, &store)?;
    assert_eq!(resumed.cursor, 2);
    assert_eq!(resumed.manuscript, state.manuscript);

    Ok(())
}

#[test]
fn enhancement_doubles_each_unit_within_its_band() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let originals = MemoryChapterStore::new();
    let enhanced = FsChapterStore::new(temp.path().join("enhanced"));
    let prompts = PromptRegistry::new()?;
    let config = EnhancementConfig::default();
    let generation = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(500);

    let mut manuscript = String::new();
    for number in 2..=10 {
        let text = prose(&format!("original-{number}"), 1000);
        originals.put_chapter(number, &text)?;
        manuscript.push_str(&text);
        manuscript.push_str("\n\n");
    }

    let generator = MockTextGenerator::new(Vec::<String>::new(), prose("expanded", 1300));
    let enhancer = Enhancer::new(&prompts, &config, &generation, &sink);
    let report = enhancer.enhance(&plan, &manuscript, &originals, &generator, &enhanced)?;

    assert_eq!(report.original_words, 9000);
    assert_eq!(report.band.target, 18000);
    assert_eq!(report.chapters.len(), 9);
    for chapter in &report.chapters {
        assert_eq!(chapter.original_words, 1000);
        assert!(!chapter.estimated);
        assert!(chapter.band.contains(chapter.word_count));
        assert!((1800..=2200).contains(&chapter.word_count));

        let section = &chapter.sections[0];
        assert_eq!(section.correction, BandCorrection::Truncated);
        assert_eq!(section.word_count, 1000);
    }
    assert!(report.within_band());
    assert_eq!(enhanced.chapters()?.len(), 9);
    assert!(temp.path().join("enhanced/manuscript.txt").exists());

    let sent = generator.prompts();
    assert_eq!(sent.len(), 9);
    assert!(sent[0].contains("original-2") && sent[0].contains("\"default_style\""));
    assert!(sent[1].contains("Previous chapter (expanded):\nexpanded"));

    Ok(())
}

#[test]
fn enhancement_pads_short_chapters_and_ignores_headers() -> Result<(), Box<dyn std::error::Error>>
{
    let originals = MemoryChapterStore::new();
    let enhanced = MemoryChapterStore::new();
    let prompts = PromptRegistry::new()?;
    let config = EnhancementConfig::default();
    let generation = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = nine_chapter_plan(300);

    let mut manuscript = String::new();
    for chapter in plan.chapters() {
        let text = prose(&format!("original-{}", chapter.number), 1000);
        let stored = if chapter.number == 10 { "" } else { text.as_str() };
        originals.put_chapter(chapter.number, stored)?;
        append_chapter(&mut manuscript, chapter, &text);
    }
    assert!(manuscript.starts_with("Chapter 2: Tide 2\n\n"));

    let generator = MockTextGenerator::new(Vec::<String>::new(), prose("expanded", 600));
    let report = Enhancer::new(&prompts, &config, &generation, &sink).enhance(
        &plan,
        &manuscript,
        &originals,
        &generator,
        &enhanced,
    )?;

    assert_eq!(report.original_words, 9000);
    assert_eq!(report.band.target, 18000);
    for chapter in &report.chapters {
        assert_eq!(chapter.original_words, 1000);
        assert_eq!(chapter.estimated, chapter.number == 10);
        assert_eq!(chapter.sections[0].correction, BandCorrection::Unchanged);
        assert_eq!(chapter.sections[0].word_count, 600);
        assert_eq!(chapter.correction, BandCorrection::Padded);
        assert_eq!(chapter.word_count, 2000);
    }
    assert!(report.within_band());

    let padded = enhanced.chapter(10)?.expect("chapter 10 enhanced");
    assert!(padded.starts_with("expanded tide"));
    assert!(padded.contains(config.filler_phrase.trim()));
    assert!(sink
        .messages_at(LogLevel::Warn)
        .iter()
        .any(|message| message.contains("no usable stored original")));

    Ok(())
}

#[test]
fn enhancement_requires_nine_chapters() -> Result<(), Box<dyn std::error::Error>> {
    let prompts = PromptRegistry::new()?;
    let config = EnhancementConfig::default();
    let generation = GenerationConfig::default();
    let sink = VecLogSink::new();
    let plan = Plan::from_value(json!({
        "chapters": [{"number": 2, "title": "Only", "sections": []}]
    }))?;
    let generator = MockTextGenerator::new(Vec::<String>::new(), "unused.");

    let result = Enhancer::new(&prompts, &config, &generation, &sink).enhance(
        &plan,
        "text",
        &MemoryChapterStore::new(),
        &generator,
        &MemoryChapterStore::new(),
    );
    assert!(matches!(
        result,
        Err(EnhanceError::Plan(PlanError::ChapterCount {
            expected: 9,
            found: 1
        }))
    ));
    assert!(generator.prompts().is_empty());

    Ok(())
}

#[test]
fn realignment_follows_storyboard_markers() {
    let storyboard = "--- Chapter 2: Arrival ---\nnotes\n--- Chapter 3: Storm ---\n";
    let titles = recover_titles(storyboard);
    let flat = "Chapter two, roughly\nShe came ashore.\nChapter 3?\nRain.\nChapter 4\nMore rain.";

    let report = realign(flat, &titles);
    assert_eq!(report.headers_rewritten, 2);
    assert_eq!(report.excess_lines, 3);
    let lines: Vec<&str> = report.text.lines().collect();
    assert_eq!(lines[0], "--- Chapter 2: Arrival ---");
    assert_eq!(lines[2], "--- Chapter 3: Storm ---");
    assert_eq!(lines[3], "[EXCESS - REVIEW] Rain.");
    assert_eq!(lines[5], "[EXCESS - REVIEW] More rain.");
}

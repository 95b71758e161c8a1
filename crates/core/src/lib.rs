pub mod chapter;
pub mod config;
pub mod enhance;
pub mod fixer;
pub mod generation;
pub mod logging;
pub mod plan;
pub mod prompts;
pub mod store;
pub mod text;

pub use chapter::{
    run_chapters, ChapterOrchestrator, ChapterReport, ChapterStage, GenerationState,
    LengthEnforcer, Payloads, Phase, PromptCompiler, SectionContext, SectionResult, Shortfall,
    StateError, StepOutcome,
};
pub use config::{
    BackendConfig, Config, ConfigError, ConfigStore, EnhancementConfig, GenerationConfig,
    ProjectConfig, PromptConfig, RecentUsage,
};
pub use enhance::{ChapterEnhancement, EnhanceError, EnhanceReport, Enhancer, SectionEnhancement};
pub use fixer::{
    normalize_language, realign, Detection, FixerError, LanguageDetector, ModelTranslator,
    NormalizeReport, RealignReport, ScriptDetector, Translator,
};
pub use generation::{GenerationError, GenerationRequest, SamplingParams, TextGenerator};
pub use logging::{
    install_log_bridge, LogLevel, LogRecord, LogSink, NullLogSink, Scope, SharedLogSink,
    SinkLogger, StdoutLogSink, VecLogSink,
};
pub use plan::{recover_titles, Chapter, ChapterTitle, Plan, PlanError, Section};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use store::{ChapterArtifact, ChapterStore, FsChapterStore, MemoryChapterStore, StoreError};
pub use text::{count_words, Band, BandCorrection};

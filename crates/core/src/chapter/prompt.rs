use serde_json::Value;

use crate::plan::{Chapter, Plan, Section};
use crate::prompts::{PromptError, PromptRegistry};

const FRAGMENT_SEPARATOR: &str = "\n\n";

/// Operator-supplied material carried into every section prompt.
///
/// Structured payloads are rendered as pretty JSON, plain text verbatim.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payloads {
    pub characters: Option<Value>,
    pub instructions: Option<Value>,
    pub other_info: Option<Value>,
}

impl Payloads {
    /// JSON when the text parses as an object or array, a plain string
    /// otherwise. Blank input yields `None`.
    pub fn parse_text(text: &str) -> Option<Value> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
            _ => Some(Value::String(trimmed.to_string())),
        }
    }
}

pub fn render_payload(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(text) => text.trim().to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    (!rendered.is_empty()).then_some(rendered)
}

#[derive(Clone, Copy, Debug)]
pub struct SectionContext<'a> {
    /// Earlier chapters, concatenated verbatim.
    pub prior: &'a str,
    pub payloads: &'a Payloads,
}

/// Why a previous attempt was not accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shortfall {
    Words { current: usize, target: usize },
    Incomplete,
}

pub struct PromptCompiler<'a> {
    prompts: &'a PromptRegistry,
}

impl<'a> PromptCompiler<'a> {
    pub fn new(prompts: &'a PromptRegistry) -> Self {
        Self { prompts }
    }

    pub fn section_prompt(
        &self,
        plan: &Plan,
        chapter: &Chapter,
        section: &Section,
        context: &SectionContext<'_>,
    ) -> Result<String, PromptError> {
        let mut fragments = vec![self.prompts.format_with("system_framing", no_args())?];

        if !context.prior.trim().is_empty() {
            fragments.push(
                self.prompts
                    .format_with("prior_context", [("context", context.prior.trim_end())])?,
            );
        }

        let payloads = [
            ("characters", "characters", context.payloads.characters.as_ref()),
            ("instructions", "instructions", context.payloads.instructions.as_ref()),
            ("other_info", "other_info", context.payloads.other_info.as_ref()),
        ];
        for (key, argument, value) in payloads {
            if let Some(rendered) = value.and_then(render_payload) {
                fragments.push(self.prompts.format_with(key, [(argument, rendered)])?);
            }
        }
        if let Some(notes) = plan.notes.as_deref().filter(|notes| !notes.trim().is_empty()) {
            fragments.push(self.prompts.format_with("plan_notes", [("notes", notes)])?);
        }

        fragments.push(self.chapter_block(plan, chapter)?);
        fragments.push(self.prompts.format_with(
            "section_block",
            [
                ("task", section.task.clone()),
                ("instructions", section.instructions.clone()),
                ("word_count", section.word_count.to_string()),
            ],
        )?);

        Ok(fragments.join(FRAGMENT_SEPARATOR))
    }

    /// The original prompt plus the previous attempt and a directive to carry on
    /// from where it stopped.
    pub fn continuation_prompt(
        &self,
        base: &str,
        previous: &str,
        shortfall: Shortfall,
    ) -> Result<String, PromptError> {
        match shortfall {
            Shortfall::Words { current, target } => self.prompts.format_with(
                "continue_short",
                [
                    ("base", base.to_string()),
                    ("previous", previous.to_string()),
                    ("current", current.to_string()),
                    ("target", target.to_string()),
                ],
            ),
            Shortfall::Incomplete => self.prompts.format_with(
                "continue_incomplete",
                [("base", base), ("previous", previous)],
            ),
        }
    }

    pub fn chapter_block(&self, plan: &Plan, chapter: &Chapter) -> Result<String, PromptError> {
        self.prompts.format_with(
            "chapter_block",
            [
                ("number", chapter.number.to_string()),
                ("title", chapter.title.clone()),
                ("setting", or_unspecified(&chapter.setting)),
                ("characters", character_list(chapter)),
                ("style", plan.style_for(chapter).to_string()),
            ],
        )
    }
}

pub fn character_list(chapter: &Chapter) -> String {
    let names: Vec<&str> = chapter
        .characters
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        "none listed".to_string()
    } else {
        names.join(", ")
    }
}

fn or_unspecified(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "unspecified".to_string()
    } else {
        trimmed.to_string()
    }
}

fn no_args() -> [(&'static str, &'static str); 0] {
    []
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> Plan {
        Plan::from_value(json!({
            "default_style": "gothic",
            "notes": "Keep the sea present in every chapter.",
            "chapters": [{
                "number": 2,
                "title": "The Lighthouse",
                "setting": "A storm-beaten coast",
                "characters": ["Mara", "Tomas"],
                "sections": [{"task": "Mara arrives", "word_count": 600}]
            }]
        }))
        .unwrap()
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("`{needle}` missing from prompt"))
    }

    #[test]
    fn fragments_follow_fixed_order() {
        let registry = PromptRegistry::new().unwrap();
        let compiler = PromptCompiler::new(&registry);
        let plan = plan();
        let chapter = &plan.chapters()[0];
        let payloads = Payloads {
            characters: Payloads::parse_text(r#"{"Mara": "keeper's daughter"}"#),
            instructions: Payloads::parse_text("Tomas must lie."),
            other_info: None,
        };
        let prompt = compiler
            .section_prompt(
                &plan,
                chapter,
                &chapter.sections[0],
                &SectionContext {
                    prior: "Chapter 1 text.",
                    payloads: &payloads,
                },
            )
            .unwrap();

        let framing = position(&prompt, "single chapter generator");
        let prior = position(&prompt, "Chapter 1 text.");
        let characters = position(&prompt, "\"Mara\": \"keeper's daughter\"");
        let instructions = position(&prompt, "Tomas must lie.");
        let notes = position(&prompt, "Keep the sea present");
        let chapter_block = position(&prompt, "Chapter 2: The Lighthouse");
        let section_block = position(&prompt, "Section task: Mara arrives");
        assert!(framing < prior);
        assert!(prior < characters);
        assert!(characters < instructions);
        assert!(instructions < notes);
        assert!(notes < chapter_block);
        assert!(chapter_block < section_block);
        assert!(prompt.contains("Characters present: Mara, Tomas"));
        assert!(prompt.contains("Style: gothic"));
        assert!(prompt.contains("at least 600 words"));
        assert!(!prompt.contains("Other important information"));
    }

    #[test]
    fn empty_context_is_omitted() {
        let registry = PromptRegistry::new().unwrap();
        let compiler = PromptCompiler::new(&registry);
        let plan = plan();
        let chapter = &plan.chapters()[0];
        let prompt = compiler
            .section_prompt(
                &plan,
                chapter,
                &chapter.sections[0],
                &SectionContext {
                    prior: "   ",
                    payloads: &Payloads::default(),
                },
            )
            .unwrap();
        assert!(!prompt.contains("Story so far"));
        assert!(!prompt.contains("Main characters"));
    }

    #[test]
    fn continuation_directives_differ_by_shortfall() {
        let registry = PromptRegistry::new().unwrap();
        let compiler = PromptCompiler::new(&registry);

        let short = compiler
            .continuation_prompt(
                "BASE",
                "Hello world.",
                Shortfall::Words {
                    current: 2,
                    target: 400,
                },
            )
            .unwrap();
        assert!(short.starts_with("BASE"));
        assert!(short.contains("Hello world."));
        assert!(short.contains("has 2 words but at least 400"));

        let incomplete = compiler
            .continuation_prompt("BASE", "and then she", Shortfall::Incomplete)
            .unwrap();
        assert!(incomplete.contains("and then she"));
        assert!(incomplete.contains("middle of a sentence"));
        assert_ne!(short, incomplete);
    }

    #[test]
    fn plain_text_payloads_stay_strings() {
        assert_eq!(
            Payloads::parse_text("  Mara, Tomas  "),
            Some(Value::String("Mara, Tomas".into()))
        );
        assert_eq!(Payloads::parse_text("42"), Some(Value::String("42".into())));
        assert!(Payloads::parse_text(" \n").is_none());
        assert!(render_payload(&Value::Null).is_none());
    }
}

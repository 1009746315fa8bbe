//! Prompt assembly for grounded generation.
//!
//! The builder renders ranked retrieval results into a numbered context
//! block, trims it to a character budget by dropping the lowest-ranked
//! chunks first, and substitutes context and question into a template.
//!
//! ```text
//! [1] docs/cats.md (chunk 0)
//! Cats are small carnivorous mammals...
//!
//! [2] docs/pets.md (chunk 3)
//! ...
//! ```
//!
//! The question is always rendered, even when it alone is longer than the
//! budget; the budget only constrains the context block.

use thiserror::Error;

use crate::models::{Prompt, RetrievalResult};

/// Default question-answering template.
pub const DEFAULT_TEMPLATE: &str = "Answer the question using the context below. \
If the context does not contain the answer, say so and explain why.\n\n\
Context:\n{context}\n\n\
Question: {question}\n\n\
Answer:";

/// Context text used when nothing was retrieved or nothing fits.
pub const NO_CONTEXT: &str = "(no relevant context found)";

const SECTION_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("prompt template must contain a {{question}} placeholder")]
    MissingQuestion,
}

/// Deterministic prompt builder.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_context_chars: usize,
    template: String,
}

impl PromptBuilder {
    pub fn new(max_context_chars: usize) -> Self {
        Self {
            max_context_chars,
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    /// Use a custom template with `{context}` and `{question}` placeholders.
    pub fn with_template(mut self, template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        if !template.contains("{question}") {
            return Err(TemplateError::MissingQuestion);
        }
        self.template = template;
        Ok(self)
    }

    pub fn max_context_chars(&self) -> usize {
        self.max_context_chars
    }

    /// Assemble a prompt from results ordered best-first.
    pub fn build(&self, results: &[RetrievalResult], question: &str) -> Prompt {
        let mut context = String::new();
        let mut used = 0usize;
        let mut sources = Vec::new();

        for (i, result) in results.iter().enumerate() {
            let section = format!(
                "[{}] {} (chunk {})\n{}",
                i + 1,
                result.chunk.source,
                result.chunk.chunk_index,
                result.chunk.text
            );
            let separator = if context.is_empty() { 0 } else { SECTION_SEPARATOR.len() };
            let cost = separator + section.chars().count();
            if used + cost > self.max_context_chars {
                break;
            }
            if separator > 0 {
                context.push_str(SECTION_SEPARATOR);
            }
            context.push_str(&section);
            used += cost;
            sources.push(result.chunk.id.clone());
        }

        if context.is_empty() {
            context.push_str(NO_CONTEXT);
        }

        let text = render(&self.template, &context, question);
        Prompt {
            context,
            question: question.to_string(),
            text,
            sources,
        }
    }
}

/// Substitute placeholders in one left-to-right pass so that braces inside
/// the substituted values are never expanded.
fn render(template: &str, context: &str, question: &str) -> String {
    let mut out = String::with_capacity(template.len() + context.len() + question.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("{context}") {
            out.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{question}") {
            out.push_str(question);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Span};

    fn result(source: &str, index: usize, text: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            chunk: Chunk {
                id: Chunk::make_id(source, index),
                document_id: source.to_string(),
                source: source.to_string(),
                chunk_index: index,
                text: text.to_string(),
                span: Span {
                    start: 0,
                    end: text.chars().count(),
                },
            },
            score,
        }
    }

    #[test]
    fn test_empty_results_still_include_question() {
        let prompt = PromptBuilder::new(1000).build(&[], "What is a cat?");
        assert!(prompt.text.contains("What is a cat?"));
        assert!(prompt.text.contains(NO_CONTEXT));
        assert!(prompt.sources.is_empty());
    }

    #[test]
    fn test_chunks_are_verbatim_and_attributed() {
        let results = vec![
            result("cats.md", 0, "Cats purr.", 0.9),
            result("dogs.md", 2, "Dogs bark.", 0.5),
        ];
        let prompt = PromptBuilder::new(1000).build(&results, "Which animal purrs?");
        assert_eq!(
            prompt.context,
            "[1] cats.md (chunk 0)\nCats purr.\n\n[2] dogs.md (chunk 2)\nDogs bark."
        );
        assert_eq!(prompt.sources, vec!["cats.md:00000", "dogs.md:00002"]);
    }

    #[test]
    fn test_budget_drops_lowest_ranked() {
        let results = vec![
            result("a.md", 0, &"a".repeat(40), 0.9),
            result("b.md", 0, &"b".repeat(40), 0.8),
            result("c.md", 0, &"c".repeat(40), 0.7),
        ];
        // Each section is 19 header chars + 40 text chars; two fit with a separator.
        let prompt = PromptBuilder::new(125).build(&results, "q");
        assert_eq!(prompt.sources, vec!["a.md:00000", "b.md:00000"]);
        assert!(prompt.context.chars().count() <= 125);
        assert!(!prompt.context.contains("ccc"));
    }

    #[test]
    fn test_question_survives_tiny_budget() {
        let question = "a question much longer than the budget allows";
        let results = vec![result("a.md", 0, "some context", 0.9)];
        let prompt = PromptBuilder::new(5).build(&results, question);
        assert!(prompt.text.contains(question));
        assert_eq!(prompt.context, NO_CONTEXT);
    }

    #[test]
    fn test_placeholders_in_values_not_expanded() {
        let results = vec![result("a.md", 0, "literal {question} here", 0.9)];
        let prompt = PromptBuilder::new(1000).build(&results, "why {context}?");
        assert!(prompt.text.contains("literal {question} here"));
        assert!(prompt.text.contains("Question: why {context}?"));
    }

    #[test]
    fn test_custom_template() {
        let builder = PromptBuilder::new(100)
            .with_template("Q={question} C={context} {other}")
            .unwrap();
        let prompt = builder.build(&[], "hi");
        assert_eq!(prompt.text, format!("Q=hi C={} {{other}}", NO_CONTEXT));

        assert_eq!(
            PromptBuilder::new(100).with_template("{context} only").unwrap_err(),
            TemplateError::MissingQuestion
        );
    }

    #[test]
    fn test_deterministic() {
        let results = vec![result("a.md", 0, "x", 0.9), result("b.md", 1, "y", 0.1)];
        let builder = PromptBuilder::new(500);
        assert_eq!(builder.build(&results, "q"), builder.build(&results, "q"));
    }
}

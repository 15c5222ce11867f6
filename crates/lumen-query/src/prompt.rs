//! Prompt templates for code analysis.
//!
//! Each [`PromptProvider`] phrases retrieved code two ways: file by file, or
//! as one system-level picture of a whole batch.

use lumen_core::{PromptProviderType, PromptType, SearchResult};

/// System prompt sent with every analysis request.
pub const SYSTEM_PROMPT: &str = "\
You are a code analysis assistant. You are given snippets retrieved from a \
codebase by semantic search, each labelled with the file it came from, and a \
question about that codebase.

Rules:
- Ground every statement in the snippets you were given. Quote code rather than paraphrasing it.
- Name files by the path shown after `File:`.
- If the snippets do not answer the question, say so plainly instead of guessing.
- Follow the output layout requested in the user message exactly.";

/// Strategy for turning retrieved code into an LLM prompt.
pub trait PromptProvider: Send + Sync {
    /// Prompt asking for an analysis of each file in `context` on its own.
    fn file_wise_prompt(&self, context: &str, query: &str) -> String;

    /// Prompt asking for one analysis spanning everything in `context`.
    fn aggregate_prompt(&self, context: &str, query: &str) -> String;
}

/// Focuses on what the code means: purpose, key concepts, and how the pieces
/// fit together.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticPromptProvider;

/// Focuses on how the code is written: recurring patterns, interfaces,
/// error handling, and coupling.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodePatternPromptProvider;

fn preamble(context: &str, query: &str) -> String {
    format!("Question: {query}\n\nRetrieved code:\n{context}\n\n")
}

impl PromptProvider for SemanticPromptProvider {
    fn file_wise_prompt(&self, context: &str, query: &str) -> String {
        let mut prompt = preamble(context, query);
        prompt.push_str(
            "\
For every file above, explain what it contributes to the question. Use this \
layout once per file:

[FILE_ANALYSIS]
File Path: <path>
Summary: <two or three sentences on the file's role>
Key Concepts:
- <concept>: <how it shows up in this file>
Important Code Sections:
[SECTION]
Code: <the relevant lines, quoted>
Explanation: <what the lines do and why they matter for the question>
Importance Level: <High | Medium | Low>
[/SECTION]
Dependencies: <modules, crates, or services the file relies on>
Implementation Notes: <edge cases, assumptions, or caveats>
[/FILE_ANALYSIS]
",
        );
        prompt
    }

    fn aggregate_prompt(&self, context: &str, query: &str) -> String {
        let mut prompt = preamble(context, query);
        prompt.push_str(
            "\
Treat the files above as parts of one system and answer the question at that \
level. Use this layout:

[SYSTEM_ANALYSIS]
Files Analyzed: <comma-separated paths>
Critical Components:
[COMPONENT]
Name: <component>
Location: <path>
Role: <what it is responsible for>
Key Code: <the defining lines, quoted>
[/COMPONENT]
System Architecture: <how the components are layered or arranged>
Component Interactions: <calls, data flow, and shared state between them>
Shared Dependencies: <libraries or modules several components rely on>
[/SYSTEM_ANALYSIS]
",
        );
        prompt
    }
}

impl PromptProvider for CodePatternPromptProvider {
    fn file_wise_prompt(&self, context: &str, query: &str) -> String {
        let mut prompt = preamble(context, query);
        prompt.push_str(
            "\
Review each file above for the way it is written, with the question in mind. \
Once per file, report:

[FILE_PATTERNS]
File Path: <path>
Patterns: <design or implementation patterns in use, with the lines that show them>
Interfaces: <public functions, types, and signatures callers depend on>
Error Handling: <how failures are detected, propagated, or swallowed>
Coupling: <what the file imports or assumes about the rest of the code>
Improvements: <concrete simplifications or optimizations, if any>
[/FILE_PATTERNS]
",
        );
        prompt
    }

    fn aggregate_prompt(&self, context: &str, query: &str) -> String {
        let mut prompt = preamble(context, query);
        prompt.push_str(
            "\
Compare how the files above are written, with the question in mind. Report:

[PATTERN_SUMMARY]
Files Analyzed: <comma-separated paths>
Shared Patterns: <patterns that recur across files, citing where>
Inconsistencies: <places where similar problems are solved differently>
Interfaces: <the signatures that connect these files>
Error Handling: <the overall strategy and any gaps>
Coupling: <the tightest dependencies between files>
Improvements: <changes that would make the code more uniform or faster>
[/PATTERN_SUMMARY]
",
        );
        prompt
    }
}

/// The provider implementation for `kind`.
///
/// # Examples
///
/// ```
/// use lumen_core::PromptProviderType;
/// use lumen_query::prompt::provider_for;
///
/// let provider = provider_for(PromptProviderType::CodePattern);
/// let prompt = provider.aggregate_prompt("File: a.rs\nContent:\nfn a() {}\n", "error handling?");
/// assert!(prompt.contains("error handling?"));
/// ```
pub fn provider_for(kind: PromptProviderType) -> Box<dyn PromptProvider> {
    match kind {
        PromptProviderType::Semantic => Box::new(SemanticPromptProvider),
        PromptProviderType::CodePattern => Box::new(CodePatternPromptProvider),
    }
}

/// Format search results as the code context block of a prompt.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, SearchResult};
/// use lumen_query::prompt::format_code_context;
///
/// let hit = SearchResult::new("id", "fn main() {}", 0.9, source_metadata("src/main.rs"));
/// assert_eq!(format_code_context(&[hit]), "File: src/main.rs\nContent:\nfn main() {}\n");
/// ```
pub fn format_code_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("File: {}\nContent:\n{}\n", r.source_file, r.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// A prompt ready to send, with the batch and files it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    /// Zero-based batch index.
    pub batch_index: usize,
    /// Distinct source files in the prompt, in first-appearance order.
    pub source_files: Vec<String>,
    /// Full user message.
    pub text: String,
}

fn distinct_sources(results: &[SearchResult]) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for r in results {
        if !files.contains(&r.source_file) {
            files.push(r.source_file.clone());
        }
    }
    files
}

/// Render the prompts for one batch of results.
///
/// [`PromptType::Aggregate`] yields one prompt for the batch.
/// [`PromptType::FileWise`] yields one prompt per distinct source file.
/// An empty batch yields no prompts.
pub fn render_prompts(
    batch_index: usize,
    results: &[SearchResult],
    query: &str,
    prompt_type: PromptType,
    provider: PromptProviderType,
) -> Vec<RenderedPrompt> {
    if results.is_empty() {
        return Vec::new();
    }
    let provider = provider_for(provider);
    match prompt_type {
        PromptType::Aggregate => vec![RenderedPrompt {
            batch_index,
            source_files: distinct_sources(results),
            text: provider.aggregate_prompt(&format_code_context(results), query),
        }],
        PromptType::FileWise => distinct_sources(results)
            .into_iter()
            .map(|file| {
                let hits: Vec<SearchResult> = results
                    .iter()
                    .filter(|r| r.source_file == file)
                    .cloned()
                    .collect();
                RenderedPrompt {
                    batch_index,
                    text: provider.file_wise_prompt(&format_code_context(&hits), query),
                    source_files: vec![file],
                }
            })
            .collect(),
    }
}

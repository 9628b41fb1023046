//! "Did you mean" suggestions for unmatched tokens.
//!
//! For every token the parser could not place, the step compares it with the
//! visible subcommands and options of the matched command and prints the
//! closest ones:
//!
//! ```text
//! 'stauts' was not matched. Did you mean one of the following?
//! status
//! ```
//!
//! The step only reports. It always continues the chain; whether the
//! invocation fails is up to parse-error reporting.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::InvocationContext;
use crate::pipeline::{Middleware, Next, PipelineBuilder};
use crate::priority::Priority;
use crate::resources;

/// Scores how far apart two identifiers are. Lower is closer.
pub trait DistanceScorer: Send + Sync {
    /// Distance between `a` and `b`.
    fn distance(&self, a: &str, b: &str) -> usize;
}

/// Levenshtein edit distance.
#[derive(Debug, Default, Clone, Copy)]
pub struct Levenshtein;

impl DistanceScorer for Levenshtein {
    fn distance(&self, a: &str, b: &str) -> usize {
        strsim::levenshtein(a, b)
    }
}

/// Configuration for typo correction.
#[derive(Clone)]
pub struct TypoOptions {
    /// Candidates farther than this are never suggested.
    pub max_distance: usize,
    /// The scoring function.
    pub scorer: Arc<dyn DistanceScorer>,
}

impl Default for TypoOptions {
    fn default() -> Self {
        Self {
            max_distance: 3,
            scorer: Arc::new(Levenshtein),
        }
    }
}

impl std::fmt::Debug for TypoOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypoOptions")
            .field("max_distance", &self.max_distance)
            .finish_non_exhaustive()
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Picks the suggestions for `token` among `groups`.
///
/// Each group holds every spelling of one symbol and contributes at most its
/// closest spelling. Spellings farther than `max_distance` are dropped; the
/// rest are ranked by distance, then by longest common prefix with the token,
/// and only those tied at the best distance are returned.
pub fn suggest(token: &str, groups: &[Vec<String>], options: &TypoOptions) -> Vec<String> {
    let mut scored: Vec<(usize, usize, &str)> = groups
        .iter()
        .filter_map(|names| {
            names
                .iter()
                .map(|name| (options.scorer.distance(token, name), name.as_str()))
                .min_by_key(|(distance, _)| *distance)
        })
        .filter(|(distance, _)| *distance <= options.max_distance)
        .map(|(distance, name)| (distance, common_prefix_len(token, name), name))
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let Some(best) = scored.first().map(|(distance, _, _)| *distance) else {
        return Vec::new();
    };
    scored
        .into_iter()
        .take_while(|(distance, _, _)| *distance == best)
        .map(|(_, _, name)| name.to_string())
        .collect()
}

/// Prints suggestions for unmatched tokens, then continues.
#[derive(Debug, Clone, Default)]
pub struct TypoCorrection {
    options: TypoOptions,
}

impl TypoCorrection {
    /// Uses `options`.
    pub fn new(options: TypoOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Middleware for TypoCorrection {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        let blocks = self.corrections(ctx);
        if !blocks.is_empty() {
            write_corrections(ctx, &blocks)?;
        }
        next.run(ctx).await
    }
}

impl TypoCorrection {
    fn corrections(&self, ctx: &InvocationContext) -> Vec<(String, Vec<String>)> {
        let parse = ctx.parse_result();
        if parse.unmatched_tokens().is_empty() || !parse.treats_unmatched_tokens_as_errors() {
            return Vec::new();
        }

        let groups = parse.candidates();
        parse
            .unmatched_tokens()
            .iter()
            .map(|token| (token.clone(), suggest(token, &groups, &self.options)))
            .filter(|(_, suggestions)| !suggestions.is_empty())
            .collect()
    }
}

fn write_corrections(
    ctx: &mut InvocationContext,
    blocks: &[(String, Vec<String>)],
) -> std::io::Result<()> {
    let out = ctx.console().out();
    for (token, suggestions) in blocks {
        tracing::debug!(token = %token, count = suggestions.len(), "suggesting corrections");
        writeln!(out, "{}", resources::suggestion_header(token))?;
        for suggestion in suggestions {
            writeln!(out, "{}", suggestion)?;
        }
    }
    Ok(())
}

impl PipelineBuilder {
    /// Enables typo suggestions with a maximum edit distance of 3.
    pub fn use_typo_corrections(self) -> Self {
        self.use_typo_corrections_with(TypoOptions::default())
    }

    /// Enables typo suggestions with custom options.
    pub fn use_typo_corrections_with(mut self, options: TypoOptions) -> Self {
        if !self.enable("typo-corrections") {
            return self;
        }
        self.add_middleware(Priority::TypoCorrection, TypoCorrection::new(options))
    }
}

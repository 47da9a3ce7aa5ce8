//! Iterative context filtering.
//!
//! Each pass strips noise from a raw context with the current filter prompt,
//! answers the query from what is left, and judges the answer. Weak passes
//! produce an improved filter prompt for the next pass.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::candidate::{preview, CaseDetail, CaseId, Candidate, EngineKind, StrategyExtra};
use crate::client::Message;
use crate::optimizer::{StepContext, StepResult, Strategy};
use crate::parsing::{parse_filter_reply, FilteredContext};
use crate::prompts::{self, FILTERED_ANSWER, FILTER_OPTIMIZER, FILTER_SYSTEM, FILTER_USER};
use crate::session::{Phase, Session};

pub const FILTER_TEMPERATURE: f64 = 0.3;
pub const OPTIMIZER_TEMPERATURE: f64 = 0.5;

pub const MAX_PASSES: u32 = 5;

/// Primary-case quality that ends the run.
pub const TARGET_QUALITY: f64 = 90.0;

/// Below this primary-case quality the filter is rewritten.
pub const IMPROVE_BELOW: f64 = 80.0;

const REMOVED_SAMPLE: usize = 3;
const ANSWER_FAILED: &str = "Response generation failed";

#[derive(Debug, Clone)]
pub struct ContextFilterStrategy {
    filter_prompt: String,
    raw_context: Option<String>,
    query: Option<String>,
    pass: u32,
}

impl Default for ContextFilterStrategy {
    fn default() -> Self {
        Self::new()
    }
}

/// One filtered-and-answered case.
struct PassOutcome {
    filtered: FilteredContext,
    answer: Option<String>,
}

impl ContextFilterStrategy {
    pub fn new() -> Self {
        ContextFilterStrategy {
            filter_prompt: FILTER_SYSTEM.to_string(),
            raw_context: None,
            query: None,
            pass: 0,
        }
    }

    /// Raw context and query for the primary case. The primary score is
    /// recorded under the first active bench case, or under the golden path
    /// when the bench is empty. Without a context the first active bench
    /// input is the primary case; without a query the seed prompt is used.
    pub fn set_context(&mut self, raw_context: impl Into<String>, query: impl Into<String>) {
        self.raw_context = Some(raw_context.into());
        self.query = Some(query.into());
    }

    /// Query only; the primary context comes from the bench.
    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = Some(query.into());
    }

    pub fn with_context(mut self, raw_context: impl Into<String>, query: impl Into<String>) -> Self {
        self.set_context(raw_context, query);
        self
    }

    /// The filter prompt the next pass will use.
    pub fn filter_prompt(&self) -> &str {
        &self.filter_prompt
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    /// Case id and raw context of the primary case, if there is one.
    fn primary_case(&self, session: &Session) -> Option<(CaseId, String)> {
        let first = session.test_bench.active_cases().into_iter().next();
        match (&self.raw_context, first) {
            (Some(raw), Some((case, _))) => Some((case, raw.clone())),
            (Some(raw), None) => Some((CaseId::GoldenPath, raw.clone())),
            (None, Some((case, input))) => Some((case, input.to_string())),
            (None, None) => None,
        }
    }

    fn query(&self, session: &Session) -> String {
        self.query.clone().unwrap_or_else(|| session.seed_prompt.clone())
    }

    fn filter(ctx: &StepContext<'_>, filter_prompt: &str, raw: &str, query: &str) -> FilteredContext {
        let conversation = [
            Message::system(filter_prompt),
            Message::user(prompts::render(FILTER_USER, &[("context", raw), ("query", query)])),
        ];
        let reply = ctx.call(&conversation, Some(FILTER_TEMPERATURE));
        if !reply.success {
            warn!(error = %reply.error_message(), "filter call failed, using raw context");
            return FilteredContext::passthrough(raw);
        }
        let filtered = parse_filter_reply(&reply.content, raw);
        if filtered.used_fallback {
            debug!("filter reply had no UNBIASED CONTEXT section");
        }
        filtered
    }

    fn filter_and_answer(
        ctx: &StepContext<'_>,
        session: &Session,
        filter_prompt: &str,
        raw: &str,
        query: &str,
    ) -> PassOutcome {
        let filtered = Self::filter(ctx, filter_prompt, raw, query);
        let user = prompts::render(FILTERED_ANSWER, &[("context", &filtered.clean), ("query", query)]);
        let answer = ctx
            .execute_prompt(&session.seed_prompt, &user, session.config.temperature)
            .map_err(|err| warn!(error = %err, "answer generation failed"))
            .ok();
        PassOutcome { filtered, answer }
    }

    fn improve(&self, ctx: &StepContext<'_>, score: f64, filtered_out: &[String]) -> Option<String> {
        let removed = if filtered_out.is_empty() {
            "None observed".to_string()
        } else {
            filtered_out
                .iter()
                .take(REMOVED_SAMPLE)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let request = prompts::render(
            FILTER_OPTIMIZER,
            &[
                ("score", &format!("{:.1}", score)),
                ("current", &self.filter_prompt),
                ("removed", &removed),
                ("kept", "Unknown"),
            ],
        );
        let reply = ctx.call(&[Message::user(request)], Some(OPTIMIZER_TEMPERATURE));
        let text = reply.content.trim();
        if reply.success && !text.is_empty() {
            Some(text.to_string())
        } else {
            warn!(error = %reply.error_message(), "filter optimization failed, keeping current filter");
            None
        }
    }
}

/// Share of input words the filter removed, in [0, 1].
pub fn noise_reduction(raw: &str, clean: &str) -> f64 {
    let before = raw.split_whitespace().count();
    if before == 0 {
        return 0.0;
    }
    let after = clean.split_whitespace().count();
    (1.0 - after as f64 / before as f64).clamp(0.0, 1.0)
}

impl Strategy for ContextFilterStrategy {
    fn kind(&self) -> EngineKind {
        EngineKind::ContextFilter
    }

    fn step(&mut self, ctx: &StepContext<'_>, session: &mut Session) -> Result<StepResult> {
        let step = session.current_step;
        let Some((primary_case, raw)) = self.primary_case(session) else {
            warn!(step, "no context to filter");
            session.narrate("No context to filter: the bench is empty and no context was given");
            return Ok(StepResult::new(session, Vec::new(), true)
                .with_error("No context to filter: the bench is empty and no context was given"));
        };
        self.pass += 1;
        let pass = self.pass;
        let filter_prompt = self.filter_prompt.clone();
        let query = self.query(session);

        session.set_phase(Phase::Filtering, "filter");
        session.narrate(format!(
            "[Context filter - pass {}/{}]\nFiltering {} words of context\nFilter: \"{}\"",
            pass,
            MAX_PASSES,
            raw.split_whitespace().count(),
            preview(&filter_prompt, 60)
        ));
        let primary = Self::filter_and_answer(ctx, session, &filter_prompt, &raw, &query);

        session.set_phase(Phase::Evaluation, "judge");
        let response = primary.answer.clone().unwrap_or_else(|| ANSWER_FAILED.to_string());
        let judged = ctx.judge.evaluate(
            &filter_prompt,
            &format!("Context: {}\nQuery: {}", raw, query),
            &response,
        );
        let quality = judged.score;

        let mut candidate = Candidate::new(EngineKind::ContextFilter, step, filter_prompt.clone())
            .with_display_text(format!("Strategy: {}", preview(&filter_prompt, 60)))
            .with_extra(StrategyExtra::ContextFilter {
                clean_context: primary.filtered.clean.clone(),
                filtered_items: primary.filtered.filtered_out.clone(),
                noise_reduction_rate: noise_reduction(&raw, &primary.filtered.clean),
                pass_number: pass,
            });
        candidate.record_case(
            primary_case,
            quality,
            CaseDetail {
                response,
                reasoning: judged.reasoning,
            },
        );

        let improved = if quality < IMPROVE_BELOW && pass < MAX_PASSES && !ctx.stop_requested() {
            session.set_phase(Phase::Optimization, "optimizer");
            session.narrate(format!(
                "[Context filter - pass {}/{}]\nQuality {:.1} is below {:.0}\nRewriting the filter prompt",
                pass, MAX_PASSES, quality, IMPROVE_BELOW
            ));
            self.improve(ctx, quality, &primary.filtered.filtered_out)
        } else {
            None
        };

        // Remaining cases run under the same filter as the primary case.
        session.set_phase(Phase::Evaluation, "judge");
        let remaining: Vec<(CaseId, String)> = session
            .test_bench
            .active_cases()
            .into_iter()
            .filter(|(case, _)| *case != primary_case)
            .map(|(case, input)| (case, input.to_string()))
            .collect();
        for (case, input) in remaining {
            if ctx.stop_requested() {
                info!(step, "stop requested, skipping remaining cases");
                break;
            }
            let outcome = Self::filter_and_answer(ctx, session, &filter_prompt, &input, &query);
            let (score, detail) = match outcome.answer {
                Some(answer) => {
                    let result = ctx.judge.evaluate(&filter_prompt, &input, &answer);
                    (
                        result.score,
                        CaseDetail {
                            response: answer,
                            reasoning: result.reasoning,
                        },
                    )
                }
                None => (
                    0.0,
                    CaseDetail {
                        response: String::new(),
                        reasoning: format!("Error: {}", ANSWER_FAILED),
                    },
                ),
            };
            candidate.record_case(case, score, detail);
        }

        if let Some(next) = improved {
            debug!(pass, "adopting improved filter prompt for the next pass");
            self.filter_prompt = next;
        }

        session.push_candidate(candidate.clone())?;
        session.record_step_best(step, &candidate)?;

        let should_stop = quality >= TARGET_QUALITY || pass >= MAX_PASSES;
        info!(pass, quality, aggregate = candidate.aggregate_score(), should_stop, "filter pass complete");
        session.set_phase(Phase::Idle, "");
        session.narrate(format!(
            "Pass {} complete. Quality {:.1}, noise removed {:.0}%",
            pass,
            quality,
            noise_reduction(&raw, &primary.filtered.clean) * 100.0
        ));
        Ok(StepResult::new(session, vec![candidate], should_stop))
    }

    fn reset(&mut self) {
        self.filter_prompt = FILTER_SYSTEM.to_string();
        self.pass = 0;
    }
}

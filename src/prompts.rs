//! Fixed instruction texts sent to the backend, with `{{name}}` placeholders.

/// Fill `{{name}}` placeholders in one pass. Substituted values are not
/// re-scanned, so a value containing `{{...}}` is inserted literally.
/// Unknown placeholders are left as they are.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = &after[..close];
                match vars.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// -- judge ------------------------------------------------------------------

pub const JUDGE_SYSTEM: &str = "You are a strict evaluator of AI assistant responses. Score how well the response carries out the task prompt for the given input.

Criteria, 0-25 points each:
1. accuracy: the response is correct and complete.
2. relevance: the response addresses the task directly.
3. clarity: the response is well organized and easy to read.
4. instruction_following: the response obeys every instruction in the task prompt.

The overall score is the sum of the four criteria, from 0 to 100. Keep 90 and above for exceptional responses. Take edge cases and adversarial inputs into account.

Reply with one JSON object and nothing else:
{\"score\": <0-100>, \"breakdown\": {\"accuracy\": <0-25>, \"relevance\": <0-25>, \"clarity\": <0-25>, \"instruction_following\": <0-25>}, \"reasoning\": \"<one or two sentences>\"}";

pub const JUDGE_USER: &str = "TASK PROMPT:
{{prompt}}

INPUT:
{{input}}

RESPONSE UNDER REVIEW:
{{response}}

Return the JSON score.";

pub const CUSTOM_RUBRIC_HEADER: &str = "\n\nADDITIONAL CRITERIA FROM THE USER:\n";

// -- iterative meta-prompting ----------------------------------------------

pub const ITERATIVE_SYSTEM: &str = "You optimize prompts. You receive a task description, the history of earlier prompt attempts with their scores, and the best score so far.

Propose a new prompt that differs from every earlier attempt, is likely to beat the best score, and gives clear, specific instructions. Use the history: keep what made high scorers work and avoid what pulled low scorers down.";

pub const ITERATIVE_USER: &str = "TASK DESCRIPTION:
{{task}}

HISTORY:
{{trajectory}}

Best score so far: {{best_score}}

Write {{count}} new prompt variation(s) that could score higher, each with a short justification.

Use exactly this layout:
VARIATION 1:
<the new prompt>
REASONING: <why it should score higher>";

// -- instruction induction ---------------------------------------------------

pub const INDUCTION_SYSTEM: &str = "You reverse-engineer instructions. Given example inputs and the outputs produced from them, work out the exact instruction that was followed.

Look at how each input was transformed, which style or format the outputs share, and which rules seem to apply. The instruction must be precise enough to reproduce the outputs.";

pub const INDUCTION_USER_HEADER: &str =
    "Someone was given an instruction and produced these outputs from these inputs. What was the exact instruction?\n\n";

pub const INDUCTION_EXAMPLE: &str = "EXAMPLE {{n}}:
Input: {{input}}
Output: {{output}}

";

pub const INDUCTION_USER_FOOTER: &str = "Reply with the deduced instruction only.";

pub const RESAMPLE: &str = "Here is an instruction:
\"{{instruction}}\"

Write {{count}} variations of it. Keep the core intent but change the wording, level of detail or structure so that edge cases are handled better.

Put each variation on its own line, numbered 1 to {{count}}.";

// -- evolutionary search ------------------------------------------------------

pub const ZERO_ORDER: &str = "Rewrite this prompt so that it is {{direction}}.

PROMPT:
{{prompt}}

Return only the rewritten prompt.";

pub const FIRST_ORDER: &str = "Improve a task prompt by applying a mutation instruction to it.

TASK PROMPT:
{{task_prompt}}

MUTATION INSTRUCTION:
{{mutation_prompt}}

Return only the improved task prompt.";

pub const CROSSOVER: &str = "Merge the strongest parts of two prompts into one better prompt.

PROMPT A (score {{score_a}}):
{{prompt_a}}

PROMPT B (score {{score_b}}):
{{prompt_b}}

Return only the merged prompt.";

/// Stylistic targets for zero-order rewrites.
pub const MUTATION_DIRECTIONS: [&str; 6] = [
    "more formal",
    "more concise",
    "more detailed",
    "step-by-step",
    "more technical",
    "simpler",
];

/// Pool of mutation instructions for first-order rewrites.
pub const MUTATION_PROMPTS: [&str; 8] = [
    "Open with an instruction to think step by step",
    "State every constraint explicitly as a numbered list",
    "Include an example of the expected output format",
    "Use plainer, more direct language",
    "Give the model an expert persona",
    "Split the task into numbered sub-tasks",
    "End with criteria for checking the answer",
    "Spell out what the model must not do",
];

// -- context filtering --------------------------------------------------------

pub const FILTER_SYSTEM: &str = "You filter context. From a text, keep only the information that is relevant and unbiased.

Drop off-topic tangents. Drop opinionated or leading statements that could mislead. Keep every relevant fact. Keep the cleaned context separate from the question, because another model will answer the question from your output.";

pub const FILTER_USER: &str = "Extract the unbiased, relevant part of the text below for answering the question.

RAW CONTEXT:
{{context}}

QUESTION:
{{query}}

Answer in this format:
UNBIASED CONTEXT:
<relevant facts only>

FILTERED OUT:
<one removed item per line, with the reason>";

pub const FILTER_OPTIMIZER: &str = "A context-filter prompt scored {{score}}.

CURRENT FILTER PROMPT:
{{current}}

OBSERVED ISSUES:
- Content that was removed: {{removed}}
- Noise that got through: {{kept}}

Write an improved filter prompt that fixes these issues. Return only the prompt.";

pub const FILTERED_ANSWER: &str = "Context Information:
---
{{context}}
---

Instruction: Based on the context above, {{query}}";

//! Prompt text for chunk analysis and the final summary call.

use parley_core::models::{Chunk, Highlight, ProfileContext};

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are an expert negotiation analyst. You read transcript excerpts and flag language that works against a fair negotiation.

Report findings in exactly three categories:
- "manipulation": tactics that pressure or mislead (false urgency, guilt tripping, gaslighting, intimidation, love bombing, moving goalposts).
- "cognitive_bias": framing that exploits predictable judgment errors (anchoring, loss aversion, sunk cost, social proof, scarcity, framing effects).
- "rhetological_fallacy": flawed arguments (ad hominem, straw man, false dilemma, slippery slope, appeal to authority, bandwagon).

Severity scale:
1 = mild or ambiguous
2 = clear and deliberate
3 = aggressive or central to the exchange

Rules:
- "quote" must be copied verbatim from the excerpt, a short phrase or sentence, never paraphrased.
- "label" is a short tactic name such as "false urgency" or "anchoring".
- Report each distinct occurrence once. Do not invent findings.

Respond with JSON only, in this shape:
{"findings":[{"category":"manipulation","label":"false urgency","quote":"...","severity":2,"explanation":"..."}]}
If nothing qualifies respond with {"findings":[]}."#;

pub const SUMMARY_SYSTEM_PROMPT: &str = r#"You are an expert negotiation coach. You receive the highlights already detected in a negotiation transcript and write a short assessment.

Respond with JSON only, in this shape:
{"overall":"two or three sentences on what happened","strategic":"two or three sentences of concrete advice","barometer":{"score":0,"label":"calm","rationale":"one sentence"}}

"score" is an integer 0-100 measuring how adversarial or risky the negotiation is. "label" is one of calm, guarded, tense, hostile."#;

/// Everything besides the chunk that shapes a chunk prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub participants: Option<Vec<String>>,
    pub profile: Option<ProfileContext>,
    pub max_highlights_per_1000_words: u32,
}

/// Highlight cap for a chunk: `ceil(words / 1000 × per_1000)`, at least 1.
pub fn highlight_cap(text: &str, per_1000_words: u32) -> usize {
    let words = text.split_whitespace().count() as u64;
    let cap = (words * u64::from(per_1000_words)).div_ceil(1000);
    cap.max(1) as usize
}

pub fn chunk_user_prompt(chunk: &Chunk, total_chunks: usize, ctx: &PromptContext) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Excerpt {} of {} from a negotiation transcript.\n",
        chunk.number(),
        total_chunks
    ));
    if chunk.overlap > 0 {
        prompt.push_str(
            "The excerpt begins with text repeated from the previous excerpt; analyze it normally.\n",
        );
    }

    match &ctx.participants {
        Some(names) if !names.is_empty() => {
            prompt.push_str(&format!(
                "Only report findings in statements made by: {}.\n",
                names.join(", ")
            ));
        }
        _ => prompt.push_str("Consider statements from every speaker.\n"),
    }

    if let Some(profile) = ctx.profile.as_ref().filter(|p| !p.is_empty()) {
        prompt.push_str("\nContext about the person being advised:\n");
        for (key, value) in profile.iter() {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
    }

    prompt.push_str(&format!(
        "\nReport at most {} findings, most severe first.\n",
        highlight_cap(&chunk.text, ctx.max_highlights_per_1000_words)
    ));
    prompt.push_str("\n<excerpt>\n");
    prompt.push_str(&chunk.text);
    prompt.push_str("\n</excerpt>\n");
    prompt
}

pub fn summary_user_prompt(highlights: &[Highlight], profile: Option<&ProfileContext>) -> String {
    let mut prompt = String::new();
    if let Some(profile) = profile.filter(|p| !p.is_empty()) {
        prompt.push_str("Context about the person being advised:\n");
        for (key, value) in profile.iter() {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
        prompt.push('\n');
    }

    if highlights.is_empty() {
        prompt.push_str("No highlights were detected in the transcript.\n");
        return prompt;
    }

    prompt.push_str(&format!("{} highlights were detected:\n", highlights.len()));
    for h in highlights {
        prompt.push_str(&format!(
            "- [{}] {} (severity {}): \"{}\"\n",
            h.category,
            h.label,
            h.severity,
            clip(&h.text, 200)
        ));
    }
    prompt
}

fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

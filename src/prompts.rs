//! Prompts for the proposer and critic roles.
//!
//! Every prompt lives here so the negotiation logic in
//! [`crate::pipeline::llm`] never embeds wording, and unit tests can check
//! the markers the response parser relies on without calling a model.

/// Marker the proposer places before its instruction.
pub const FINAL_INSTRUCTION_MARKER: &str = "FINAL INSTRUCTION:";

/// Critic marker for acceptance.
pub const SATISFIED_MARKER: &str = "SATISFIED";

/// Critic marker for a clarification request; the question follows it.
pub const CLARIFICATION_MARKER: &str = "CLARIFICATION_NEEDED:";

/// Proposer reply for an image that shows no assembly step (a parts list,
/// a warning panel, a cover). Matched case-insensitively, plural allowed.
pub const NO_STEP_MARKER: &str = "NO ASSEMBLY STEP";

/// System prompt for the vision-enabled proposer.
///
/// Asks for visible reasoning before the instruction: listing parts first
/// makes the model commit to part numbers it can actually see.
pub const PROPOSER_SYSTEM_PROMPT: &str = r#"You are an expert furniture assembly instructor. Your goal is to describe one assembly step clearly based on the provided diagram.

Before writing the instruction, follow this process:
1. List all objects visible in the diagram.
2. Compare their sizes and shapes to identify specific part numbers and hardware.
3. Note the quantity of each part and any arrows showing direction or rotation.
4. Identify potential ambiguities (e.g. "Do not confuse Bolt A with Bolt B").
5. Only THEN write the final instruction.

If the diagram shows no assembly step at all (a parts list, a warning, a cover), write NO ASSEMBLY STEP as the final instruction.

Output format:
THOUGHTS: <your reasoning>
FINAL INSTRUCTION: <one clear instruction a beginner can follow>"#;

/// User text accompanying the step image on the first proposal.
pub const PROPOSER_USER_PROMPT: &str =
    "Analyze this assembly step diagram and write the instruction for it.";

/// System prompt for a revision after the critic asked a question.
pub const CLARIFICATION_SYSTEM_PROMPT: &str = r#"You are an expert furniture assembly instructor. A beginner who cannot see the diagram found your instruction unclear and asked a question. Look at the diagram again and rewrite the instruction so the question no longer needs to be asked. Keep it to a single step.

Output format:
THOUGHTS: <what the diagram shows that answers the question>
FINAL INSTRUCTION: <the rewritten instruction>"#;

/// Build the revision request for the proposer.
pub fn clarification_request(previous_draft: &str, question: &str) -> String {
    format!(
        "Previous instruction: \"{}\"\nQuestion from the builder: \"{}\"\nRewrite the instruction.",
        previous_draft.trim(),
        question.trim()
    )
}

/// Context message carrying the previous step's final text.
pub fn prior_step_context(prior_step: &str) -> String {
    format!(
        "For continuity, the previous assembly step was:\n\n\"\"\"{}\"\"\"\n\nDo not repeat it; describe only the step in the new diagram.",
        prior_step.trim()
    )
}

/// System prompt for the text-only critic.
pub const CRITIC_SYSTEM_PROMPT: &str = r#"You are a cautious novice builder. You cannot see diagrams, only text. Critique each instruction aggressively for clarity: are the parts identified, is the quantity stated, is the orientation clear?

Reply with exactly one of:
SATISFIED
CLARIFICATION_NEEDED: <your single most important question>"#;

/// Few-shot `(instruction, reply)` pairs shown to the critic before the draft.
pub const CRITIC_EXAMPLES: &[(&str, &str)] = &[
    (
        "Attach the legs to the frame.",
        "CLARIFICATION_NEEDED: Which legs? Where on the frame do they go?",
    ),
    (
        "Take the two front legs (Part A) and screw them into the front holes of the frame using Screw 102.",
        "SATISFIED",
    ),
];

/// System prompt for the optional self-review of a first draft.
pub const REFLECTION_SYSTEM_PROMPT: &str = "You are a strict quality control critic. \
Look at this draft instruction. Is there ANY part that a beginner might misunderstand? \
Is the part number missing? Is the orientation clear? \
If it is vague, rewrite it to be bulletproof. \
If it is perfect, output it exactly as is. \
Reply with the instruction only.";

/// Present a first draft for self-review.
pub fn reflection_request(draft: &str) -> String {
    format!("Draft Instruction: \"{}\"\n\nImprove this if necessary.", draft.trim())
}

/// Present a draft to the critic.
pub fn critic_request(draft: &str) -> String {
    format!("Instruction: \"{}\"", draft.trim())
}

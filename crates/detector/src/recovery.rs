//! Recovery prompts injected after a confirmed loop.

use turnstile_core::LoopType;

/// Ordered nudges for a given loop type. The first attempt uses the first
/// prompt, the second attempt the second; callers stop once the list or the
/// attempt budget is exhausted.
pub(crate) fn prompts_for(loop_type: LoopType) -> &'static [&'static str] {
    match loop_type {
        LoopType::ConsecutiveIdenticalToolCalls => &[
            "You have called the same tool with the same arguments several \
             times in a row, and it is not producing new results. Stop and \
             re-read the most recent tool output. If the output already \
             answers your question, use it. Otherwise change the arguments \
             or pick a different tool before calling anything again.",
            "You are still repeating the same tool call. Do not call that \
             tool again. Summarize what you have learned so far, state what \
             is blocking you, and ask the user how to proceed.",
        ],
        LoopType::ChantingIdenticalSentences => &[
            "Your last response repeated the same phrase many times. Stop \
             generating that phrase. Take a breath, restate the task in one \
             sentence, and continue from there with fresh wording.",
            "You are still repeating yourself. End the current response now \
             with a short summary of where the task stands and wait for the \
             user's next instruction.",
        ],
        LoopType::LlmDetectedLoop => &[
            "Review of this conversation suggests you are going in circles \
             without making progress. Pause, list what you have actually \
             accomplished, identify the step that keeps failing, and try a \
             genuinely different approach to it.",
            "You appear to still be stuck. Stop working on the current \
             approach entirely. Explain to the user what you tried, why it \
             did not work, and what you would need to move forward.",
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_loop_type_has_two_escalating_prompts() {
        for loop_type in [
            LoopType::ConsecutiveIdenticalToolCalls,
            LoopType::ChantingIdenticalSentences,
            LoopType::LlmDetectedLoop,
        ] {
            let prompts = prompts_for(loop_type);
            assert_eq!(prompts.len(), 2);
            assert_ne!(prompts[0], prompts[1]);
        }
    }
}

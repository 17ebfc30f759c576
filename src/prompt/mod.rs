//! Persona prompt assembly.
//!
//! Composes the text sent to the backend from the user prompt and an
//! optional agent profile. Assembly is a pure function of its inputs: the
//! same request always produces the same prompt, which is what keeps the
//! fingerprint honest.
//!
//! Only fields actually supplied appear in the output; nothing is
//! synthesized for absent traits. When the assembled prompt exceeds the
//! configured ceiling, the situation context is truncated first, then the
//! mental-state and personality listings are dropped whole. The user prompt
//! is never cut.

use crate::api_types::AgentProfile;

const PERSONA_HEADER: &str = "### Persona";
const REQUEST_HEADER: &str = "### Request";

/// Deterministic prompt assembler.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    max_chars: usize,
}

impl PromptAssembler {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Compose the final prompt. Without a profile the user prompt passes
    /// through untouched.
    pub fn assemble(&self, user_prompt: &str, profile: Option<&AgentProfile>) -> String {
        let Some(profile) = profile else {
            return user_prompt.to_string();
        };

        // Widest rendering first; trim sections until it fits.
        let mut context_len = profile.context.as_deref().map(str::len).unwrap_or(0);
        let mut include_mental = !profile.mental_state.is_empty();
        let mut include_personality = !profile.personality.is_empty();

        loop {
            let assembled = render(
                user_prompt,
                profile,
                context_len,
                include_personality,
                include_mental,
            );
            if assembled.len() <= self.max_chars {
                return assembled;
            }

            let overshoot = assembled.len() - self.max_chars;
            if context_len > 0 {
                context_len = context_len.saturating_sub(overshoot.max(1));
                continue;
            }
            if include_mental {
                include_mental = false;
                continue;
            }
            if include_personality {
                include_personality = false;
                continue;
            }

            // Even the bare header does not fit; the user prompt wins.
            return user_prompt.to_string();
        }
    }
}

fn render(
    user_prompt: &str,
    profile: &AgentProfile,
    context_len: usize,
    include_personality: bool,
    include_mental: bool,
) -> String {
    let mut out = String::new();
    out.push_str(PERSONA_HEADER);
    out.push('\n');
    out.push_str(&format!(
        "You are {}, a {}-year-old {}.\n",
        profile.name, profile.age, profile.occupation
    ));

    if include_personality && !profile.personality.is_empty() {
        out.push_str("Personality:\n");
        for (name, value) in profile.personality.entries() {
            if let Some(value) = value {
                out.push_str(&format!("- {name}: {value:.2}\n"));
            }
        }
    }

    if include_mental && !profile.mental_state.is_empty() {
        out.push_str("Mental state:\n");
        if let Some(stress) = profile.mental_state.stress_level {
            out.push_str(&format!("- stress level: {stress:.2}\n"));
        }
        if let Some(satisfaction) = profile.mental_state.life_satisfaction {
            out.push_str(&format!("- life satisfaction: {satisfaction:.2}\n"));
        }
        if let Some(emotion) = &profile.mental_state.current_emotion {
            out.push_str(&format!("- current emotion: {emotion}\n"));
        }
    }

    if context_len > 0
        && let Some(context) = profile.context.as_deref()
    {
        let cut = context.floor_char_boundary(context_len.min(context.len()));
        let context = &context[..cut];
        if !context.is_empty() {
            out.push_str(&format!("Situation: {context}\n"));
        }
    }

    out.push_str(REQUEST_HEADER);
    out.push('\n');
    out.push_str(user_prompt);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::{MentalState, PersonalityTraits};

    fn assembler() -> PromptAssembler {
        PromptAssembler::new(8000)
    }

    fn profile() -> AgentProfile {
        AgentProfile {
            agent_id: 3,
            name: "Ines".to_string(),
            age: 41,
            occupation: "harbor pilot".to_string(),
            personality: PersonalityTraits {
                openness: Some(0.7),
                neuroticism: Some(0.3),
                ..Default::default()
            },
            mental_state: MentalState {
                stress_level: Some(0.6),
                life_satisfaction: None,
                current_emotion: Some("tense".to_string()),
            },
            context: Some("A storm is closing the strait tonight.".to_string()),
        }
    }

    #[test]
    fn no_profile_passes_prompt_through() {
        assert_eq!(assembler().assemble("just this", None), "just this");
    }

    #[test]
    fn assembly_is_deterministic() {
        let profile = profile();
        let a = assembler().assemble("Report status.", Some(&profile));
        let b = assembler().assemble("Report status.", Some(&profile));
        assert_eq!(a, b);
    }

    #[test]
    fn sections_render_in_canonical_order() {
        let prompt = assembler().assemble("Report status.", Some(&profile()));
        let expected = "### Persona\n\
            You are Ines, a 41-year-old harbor pilot.\n\
            Personality:\n\
            - openness: 0.70\n\
            - neuroticism: 0.30\n\
            Mental state:\n\
            - stress level: 0.60\n\
            - current emotion: tense\n\
            Situation: A storm is closing the strait tonight.\n\
            ### Request\n\
            Report status.";
        assert_eq!(prompt, expected);
    }

    #[test]
    fn absent_fields_are_omitted_entirely() {
        let mut profile = profile();
        profile.personality = PersonalityTraits::default();
        profile.mental_state = MentalState::default();
        profile.context = None;

        let prompt = assembler().assemble("Hi.", Some(&profile));
        assert!(!prompt.contains("Personality:"));
        assert!(!prompt.contains("Mental state:"));
        assert!(!prompt.contains("Situation:"));
        assert!(!prompt.contains("0.5"), "no synthesized defaults");
    }

    #[test]
    fn persona_ends_with_request_marker_before_user_prompt() {
        let prompt = assembler().assemble("The user prompt.", Some(&profile()));
        let marker = format!("{REQUEST_HEADER}\nThe user prompt.");
        assert!(prompt.ends_with(&marker));
    }

    #[test]
    fn context_truncated_before_listings() {
        let mut profile = profile();
        profile.context = Some("x".repeat(500));

        let full = PromptAssembler::new(8000).assemble("p", Some(&profile));
        let tight = PromptAssembler::new(full.len() - 100).assemble("p", Some(&profile));

        assert!(tight.contains("Personality:"), "listings survive first cut");
        assert!(tight.contains("Situation: "));
        assert!(tight.len() <= full.len() - 100);
    }

    #[test]
    fn listings_dropped_when_context_exhausted() {
        let mut profile = profile();
        profile.context = Some("short".to_string());

        // A limit too small for any listing but large enough for the header
        // plus the user prompt.
        let prompt = PromptAssembler::new(80).assemble("p", Some(&profile));
        assert!(prompt.len() <= 80);
        assert!(prompt.contains("You are Ines"));
        assert!(!prompt.contains("Mental state:"));
        assert!(prompt.ends_with("### Request\np"));
    }

    #[test]
    fn user_prompt_never_truncated() {
        let long_prompt = "q".repeat(300);
        let prompt = PromptAssembler::new(50).assemble(&long_prompt, Some(&profile()));
        assert!(prompt.ends_with(&long_prompt));
        // With no room for any persona section, the prompt passes through.
        assert_eq!(prompt, long_prompt);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut profile = profile();
        profile.context = Some("ночь надвигается на пролив".repeat(8));

        for limit in [120, 140, 160, 180] {
            // Must not panic on multi-byte boundaries.
            let _ = PromptAssembler::new(limit).assemble("p", Some(&profile));
        }
    }
}

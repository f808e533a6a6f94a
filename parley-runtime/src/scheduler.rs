//! Turn scheduler
//!
//! Decides which personas speak this turn and in what order. Scoring is
//! a pure function of the scheduler state, the personas, and the
//! triggering message; the only randomness is a small uniform jitter
//! drawn from a seedable RNG, so a fixed seed makes selection fully
//! deterministic.

use parley_core::{extract_mentions, Persona};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Score added for an explicit @-mention; dominates everything else.
const MENTION_BOOST: f64 = 100.0;

/// Minimum proactivity for the keep-the-conversation-going boost.
const RESPOND_PROACTIVITY_THRESHOLD: f64 = 0.4;

/// Minimum proactivity for the fresh-user-message boost.
const FRESH_PROACTIVITY_THRESHOLD: f64 = 0.6;

/// Turns a speaker stays penalized after speaking.
const COOLDOWN_TURNS: u64 = 2;

/// Per-session scheduler state. Volatile: recomputed from scratch when
/// a session's runtime binding is rebuilt.
#[derive(Debug)]
pub struct SchedulerState {
    turn_count: u64,
    last_speaker: Option<String>,
    consecutive: HashMap<String, u32>,
    cooldown_until: HashMap<String, u64>,
    last_spoke_turn: HashMap<String, u64>,
    seed: u64,
    rng: StdRng,
}

impl SchedulerState {
    /// Fresh state with a random seed.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Fresh state with a fixed seed, for reproducible selection.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            turn_count: 0,
            last_speaker: None,
            consecutive: HashMap::new(),
            cooldown_until: HashMap::new(),
            last_spoke_turn: HashMap::new(),
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The seed this state was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn last_speaker(&self) -> Option<&str> {
        self.last_speaker.as_deref()
    }

    fn turns_since_last_spoke(&self, handle: &str) -> u64 {
        self.turn_count - self.last_spoke_turn.get(handle).copied().unwrap_or(0)
    }

    fn in_cooldown(&self, handle: &str) -> bool {
        self.cooldown_until.get(handle).copied().unwrap_or(0) > self.turn_count
    }

    fn consecutive(&self, handle: &str) -> u32 {
        self.consecutive.get(handle).copied().unwrap_or(0)
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

/// The message triggering this turn.
#[derive(Debug, Clone)]
pub struct TurnInput<'a> {
    pub text: &'a str,
    /// Explicit speaker override; suppresses mention detection.
    pub target_personas: Option<&'a [String]>,
    /// Whether the trigger is a fresh user message (vs. an agent reply).
    pub is_fresh_user_message: bool,
}

/// Select the speakers for this turn, in speaking order, and advance the
/// scheduler state.
pub fn next_turn<'a>(
    personas: &'a [Persona],
    state: &mut SchedulerState,
    input: &TurnInput<'_>,
) -> Vec<&'a Persona> {
    if personas.is_empty() {
        state.turn_count += 1;
        return Vec::new();
    }

    let max_agents = personas
        .iter()
        .map(|p| p.max_agents_per_turn)
        .max()
        .unwrap_or(1)
        .max(1);

    // Mentions force selection in the order they appear. An explicit
    // target list overrides detection entirely.
    let mentioned: Vec<String> = match input.target_personas {
        Some(targets) => targets.to_vec(),
        None => extract_mentions(input.text),
    };

    let mut selected: Vec<&Persona> = Vec::new();
    for handle in &mentioned {
        if selected.len() >= max_agents {
            break;
        }
        if let Some(persona) = personas.iter().find(|p| &p.handle == handle) {
            if !selected.iter().any(|s| s.id == persona.id) {
                selected.push(persona);
            }
        }
    }

    // Remaining slots go to the highest-scoring personas with a
    // non-negative final score. Noise is drawn in persona order so a
    // fixed seed yields a fixed selection.
    let mut scored: Vec<(usize, f64)> = Vec::new();
    for (index, persona) in personas.iter().enumerate() {
        if selected.iter().any(|s| s.id == persona.id) {
            continue;
        }
        let noise = state.rng.gen_range(-0.1..=0.1);
        let score = score_persona(persona, state, input, &mentioned) + noise;
        scored.push((index, score));
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for (index, score) in scored {
        if selected.len() >= max_agents {
            break;
        }
        if score >= 0.0 {
            selected.push(&personas[index]);
        }
    }

    // Nobody scored and no mention resolved to a known persona: the
    // default persona answers alone, or the turn stays silent. A
    // mention of an unknown handle must not suppress the fallback; a
    // resolved mention never reaches here because the mention loop
    // already selected it.
    if selected.is_empty() {
        if let Some(default) = personas.iter().find(|p| p.is_default) {
            selected.push(default);
        }
    }

    // State update (rule 4).
    state.turn_count += 1;
    for persona in personas {
        if selected.iter().any(|s| s.id == persona.id) {
            *state.consecutive.entry(persona.handle.clone()).or_insert(0) += 1;
            state
                .last_spoke_turn
                .insert(persona.handle.clone(), state.turn_count - 1);
            state
                .cooldown_until
                .insert(persona.handle.clone(), state.turn_count + COOLDOWN_TURNS);
        } else {
            state.consecutive.insert(persona.handle.clone(), 0);
        }
    }
    if let Some(last) = selected.last() {
        state.last_speaker = Some(last.handle.clone());
    }

    selected
}

/// Everything in the scoring formula except the uniform jitter, which
/// the caller draws and adds.
fn score_persona(
    persona: &Persona,
    state: &SchedulerState,
    input: &TurnInput<'_>,
    mentioned: &[String],
) -> f64 {
    let mut score = persona.proactivity;

    if mentioned.contains(&persona.handle) {
        score += MENTION_BOOST;
    }

    score += 0.05 * state.turns_since_last_spoke(&persona.handle) as f64;

    if let Some(last) = state.last_speaker() {
        if last != persona.handle && persona.proactivity >= RESPOND_PROACTIVITY_THRESHOLD {
            score += 0.15;
        }
    }

    if input.is_fresh_user_message && persona.proactivity >= FRESH_PROACTIVITY_THRESHOLD {
        score += 0.2;
    }

    if state.in_cooldown(&persona.handle) {
        score -= 0.6;
    }

    score -= 0.3 * state.consecutive(&persona.handle) as f64;

    score
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn persona(id: i64, handle: &str, proactivity: f64, max_agents: usize) -> Persona {
        Persona {
            id,
            owner: "tester".to_string(),
            handle: handle.to_string(),
            display_name: handle.to_string(),
            system_prompt: format!("You are {}.", handle),
            tone: "neutral".to_string(),
            proactivity,
            memory_window: 8,
            max_agents_per_turn: max_agents,
            api_profile_id: None,
            embedding_profile_id: None,
            is_default: false,
            background_text: None,
            rag_top_k: 3,
            created_at: Utc::now(),
        }
    }

    fn user_input(text: &str) -> TurnInput<'_> {
        TurnInput {
            text,
            target_personas: None,
            is_fresh_user_message: true,
        }
    }

    #[test]
    fn test_mention_routes_to_mentioned_persona() {
        // Scenario: both personas at 0.3 proactivity, one slot. The
        // mention must win for every seed.
        for seed in 0..50 {
            let personas = vec![persona(1, "alice", 0.3, 1), persona(2, "bob", 0.3, 1)];
            let mut state = SchedulerState::with_seed(seed);
            let selected = next_turn(&personas, &mut state, &user_input("hi @bob"));
            assert_eq!(selected.len(), 1, "seed {}", seed);
            assert_eq!(selected[0].handle, "bob", "seed {}", seed);
        }
    }

    #[test]
    fn test_mentions_keep_message_order() {
        let personas = vec![
            persona(1, "alice", 0.3, 3),
            persona(2, "bob", 0.3, 3),
            persona(3, "carol", 0.3, 3),
        ];
        let mut state = SchedulerState::with_seed(7);
        let selected = next_turn(&personas, &mut state, &user_input("@carol then @alice"));
        let handles: Vec<&str> = selected.iter().map(|p| p.handle.as_str()).collect();
        assert_eq!(&handles[..2], &["carol", "alice"]);
    }

    #[test]
    fn test_target_personas_override_mentions() {
        let personas = vec![persona(1, "alice", 0.3, 1), persona(2, "bob", 0.3, 1)];
        let targets = vec!["alice".to_string()];
        let mut state = SchedulerState::with_seed(0);
        let selected = next_turn(
            &personas,
            &mut state,
            &TurnInput {
                text: "hi @bob",
                target_personas: Some(&targets),
                is_fresh_user_message: true,
            },
        );
        assert_eq!(selected[0].handle, "alice");
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_proactivity_tiebreak() {
        // Scenario: alice(0.8) vs bob(0.2), one slot, fixed seed. The
        // fresh-message boost plus base proactivity puts alice ahead by
        // more than the jitter span, so this holds for any seed; pin
        // seed 0 to match the documented scenario.
        let personas = vec![persona(1, "alice", 0.8, 1), persona(2, "bob", 0.2, 1)];
        let mut state = SchedulerState::with_seed(0);
        let selected = next_turn(&personas, &mut state, &user_input("hello"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].handle, "alice");
    }

    #[test]
    fn test_consecutive_penalty_rotates_speakers() {
        let personas = vec![persona(1, "alice", 0.8, 1), persona(2, "bob", 0.2, 1)];
        let mut state = SchedulerState::with_seed(0);

        // Force alice to speak twice in a row.
        let targets = vec!["alice".to_string()];
        for _ in 0..2 {
            let selected = next_turn(
                &personas,
                &mut state,
                &TurnInput {
                    text: "hello",
                    target_personas: Some(&targets),
                    is_fresh_user_message: true,
                },
            );
            assert_eq!(selected[0].handle, "alice");
        }
        assert_eq!(state.consecutive("alice"), 2);

        // Cooldown plus the doubled consecutive penalty sink alice below
        // bob on the next natural turn.
        let selected = next_turn(&personas, &mut state, &user_input("hello"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].handle, "bob");
    }

    #[test]
    fn test_default_persona_answers_when_nobody_scores() {
        let mut quiet = persona(1, "quiet", 0.0, 1);
        quiet.is_default = true;
        // Cooldown both so scores go negative.
        let personas = vec![quiet, persona(2, "shy", 0.0, 1)];
        let mut state = SchedulerState::with_seed(3);
        // Put both in cooldown by simulating a turn where both spoke.
        state.cooldown_until.insert("quiet".to_string(), 10);
        state.cooldown_until.insert("shy".to_string(), 10);

        let selected = next_turn(&personas, &mut state, &user_input("anyone?"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].handle, "quiet");
    }

    #[test]
    fn test_unresolved_mention_still_falls_back_to_default() {
        // An @-mention of an unknown handle must not suppress the
        // default-speaker fallback when nobody scores.
        let mut quiet = persona(1, "quiet", 0.0, 1);
        quiet.is_default = true;
        let personas = vec![quiet];
        let mut state = SchedulerState::with_seed(3);
        state.cooldown_until.insert("quiet".to_string(), 10);

        let selected = next_turn(&personas, &mut state, &user_input("hi @nobody"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].handle, "quiet");
    }

    #[test]
    fn test_silent_turn_without_default() {
        let personas = vec![persona(1, "shy", 0.0, 1)];
        let mut state = SchedulerState::with_seed(3);
        state.cooldown_until.insert("shy".to_string(), 10);
        let selected = next_turn(&personas, &mut state, &user_input("anyone?"));
        assert!(selected.is_empty());
        assert_eq!(state.turn_count(), 1);
    }

    #[test]
    fn test_selection_bounded_by_max_agents() {
        let personas: Vec<Persona> = (0..6)
            .map(|i| persona(i, &format!("p{}", i), 0.9, 2))
            .collect();
        let mut state = SchedulerState::with_seed(11);
        let selected = next_turn(&personas, &mut state, &user_input("hello all"));
        assert!(selected.len() <= 2);
        assert!(!selected.is_empty());
    }

    #[test]
    fn test_unknown_mentions_are_ignored() {
        let personas = vec![persona(1, "alice", 0.8, 1)];
        let mut state = SchedulerState::with_seed(5);
        let selected = next_turn(&personas, &mut state, &user_input("hi @nobody"));
        // Unknown handle contributes nothing; alice can still win a slot
        // on score.
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].handle, "alice");
    }

    #[test]
    fn test_state_updates_after_selection() {
        let personas = vec![persona(1, "alice", 0.8, 1), persona(2, "bob", 0.2, 1)];
        let mut state = SchedulerState::with_seed(0);
        next_turn(&personas, &mut state, &user_input("hello"));

        assert_eq!(state.turn_count(), 1);
        assert_eq!(state.last_speaker(), Some("alice"));
        assert_eq!(state.consecutive("alice"), 1);
        assert_eq!(state.consecutive("bob"), 0);
        assert!(state.in_cooldown("alice"));
        assert!(!state.in_cooldown("bob"));
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Same seed, same inputs, same selection.
            #[test]
            fn prop_deterministic_under_fixed_seed(
                seed in any::<u64>(),
                proactivities in proptest::collection::vec(0.0f64..=1.0, 1..6),
            ) {
                let personas: Vec<Persona> = proactivities
                    .iter()
                    .enumerate()
                    .map(|(i, p)| persona(i as i64, &format!("p{}", i), *p, 2))
                    .collect();

                let run = |seed: u64| {
                    let mut state = SchedulerState::with_seed(seed);
                    let input = TurnInput {
                        text: "hello there",
                        target_personas: None,
                        is_fresh_user_message: true,
                    };
                    next_turn(&personas, &mut state, &input)
                        .iter()
                        .map(|p| p.handle.clone())
                        .collect::<Vec<_>>()
                };

                prop_assert_eq!(run(seed), run(seed));
            }

            /// Mentioned personas are always selected and the bound on
            /// selection size always holds.
            #[test]
            fn prop_mentions_selected_and_bounded(
                seed in any::<u64>(),
                mention_index in 0usize..4,
            ) {
                let personas: Vec<Persona> = (0..4)
                    .map(|i| persona(i as i64, &format!("p{}", i), 0.5, 2))
                    .collect();
                let text = format!("hey @p{}", mention_index);
                let mut state = SchedulerState::with_seed(seed);
                let input = TurnInput {
                    text: &text,
                    target_personas: None,
                    is_fresh_user_message: true,
                };
                let selected = next_turn(&personas, &mut state, &input);

                let max_agents = personas.iter().map(|p| p.max_agents_per_turn).max().unwrap();
                prop_assert!(selected.len() <= max_agents);
                prop_assert!(
                    selected.iter().any(|p| p.handle == format!("p{}", mention_index)),
                    "mentioned persona not selected"
                );
            }
        }
    }
}

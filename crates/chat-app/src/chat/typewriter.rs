use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use super::message::MessageId;

pub const DEFAULT_MIN_REVEAL_DELAY: Duration = Duration::from_millis(20);
pub const DEFAULT_MAX_REVEAL_DELAY: Duration = Duration::from_millis(50);

/// Bounds of the per-character delay. Each tick draws uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealPacing {
    min_delay: Duration,
    max_delay: Duration,
}

impl RevealPacing {
    pub fn new(a: Duration, b: Duration) -> Self {
        Self {
            min_delay: a.min(b),
            max_delay: a.max(b),
        }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.min_delay == self.max_delay {
            return self.min_delay;
        }
        let low = self.min_delay.as_micros() as u64;
        let high = self.max_delay.as_micros() as u64;
        Duration::from_micros(rng.gen_range(low..=high))
    }
}

impl Default for RevealPacing {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_REVEAL_DELAY, DEFAULT_MAX_REVEAL_DELAY)
    }
}

/// Identity of one reveal. Ticks captured under an older generation are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevealGeneration(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevealPhase {
    /// Created, nothing shown yet and no tick pending.
    Idle,
    /// Behind the buffer with a tick pending.
    Revealing,
    /// Level with the buffer while the stream may still grow. No tick pending.
    CaughtUp,
    /// Level with the final text. Terminal.
    Done,
}

/// One pending advance of a reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTick {
    pub message_id: MessageId,
    pub generation: RevealGeneration,
    pub due: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealState {
    message_id: MessageId,
    generation: RevealGeneration,
    displayed_chars: usize,
    displayed_bytes: usize,
    phase: RevealPhase,
    due: Option<Instant>,
}

impl RevealState {
    fn new(message_id: MessageId, generation: RevealGeneration) -> Self {
        Self {
            message_id,
            generation,
            displayed_chars: 0,
            displayed_bytes: 0,
            phase: RevealPhase::Idle,
            due: None,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn generation(&self) -> RevealGeneration {
        self.generation
    }

    /// Characters shown so far.
    pub fn displayed_chars(&self) -> usize {
        self.displayed_chars
    }

    /// Byte offset into the text matching `displayed_chars`.
    pub fn displayed_bytes(&self) -> usize {
        self.displayed_bytes
    }

    pub fn phase(&self) -> RevealPhase {
        self.phase
    }

    pub fn pending_tick(&self) -> Option<ScheduledTick> {
        self.due.map(|due| ScheduledTick {
            message_id: self.message_id,
            generation: self.generation,
            due,
        })
    }
}

/// What firing a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick belonged to a discarded or superseded reveal.
    Stale,
    Advanced {
        displayed_chars: usize,
        next: ScheduledTick,
    },
    /// Level with a buffer that may still grow; parked until the next growth.
    CaughtUp { displayed_chars: usize },
    /// Level with the final text; the reveal is gone.
    Completed { displayed_chars: usize },
}

/// Reveals message text one character per tick, independent of arrival rate.
///
/// The typewriter never holds a copy of the text. Every call takes the live buffer so
/// growth between ticks is picked up without restarting.
#[derive(Debug)]
pub struct Typewriter {
    pacing: RevealPacing,
    rng: StdRng,
    next_generation: u64,
    states: BTreeMap<MessageId, RevealState>,
}

impl Typewriter {
    pub fn new(pacing: RevealPacing) -> Self {
        Self::with_rng(pacing, StdRng::from_entropy())
    }

    /// Reproducible jitter for tests and recordings.
    pub fn with_seed(pacing: RevealPacing, seed: u64) -> Self {
        Self::with_rng(pacing, StdRng::seed_from_u64(seed))
    }

    fn with_rng(pacing: RevealPacing, rng: StdRng) -> Self {
        Self {
            pacing,
            rng,
            next_generation: 1,
            states: BTreeMap::new(),
        }
    }

    pub fn pacing(&self) -> RevealPacing {
        self.pacing
    }

    /// Starts a fresh reveal for `message_id`, superseding any previous one.
    pub fn begin(&mut self, message_id: MessageId) -> RevealGeneration {
        let generation = RevealGeneration(self.next_generation);
        self.next_generation = self.next_generation.saturating_add(1);
        self.states
            .insert(message_id, RevealState::new(message_id, generation));
        generation
    }

    pub fn state(&self, message_id: MessageId) -> Option<&RevealState> {
        self.states.get(&message_id)
    }

    /// A message without a live reveal has nothing left to show.
    pub fn phase(&self, message_id: MessageId) -> RevealPhase {
        self.states
            .get(&message_id)
            .map_or(RevealPhase::Done, RevealState::phase)
    }

    pub fn active_count(&self) -> usize {
        self.states.len()
    }

    /// Earliest pending tick across all reveals.
    pub fn next_tick(&self) -> Option<ScheduledTick> {
        self.states
            .values()
            .filter_map(RevealState::pending_tick)
            .min_by_key(|tick| tick.due)
    }

    /// Re-arms a parked reveal after the buffer grew.
    pub fn on_growth(
        &mut self,
        message_id: MessageId,
        text: &str,
        now: Instant,
    ) -> Option<ScheduledTick> {
        let state = self.states.get_mut(&message_id)?;
        if state.due.is_some() || state.displayed_bytes >= text.len() {
            return None;
        }

        let due = now + self.pacing.sample(&mut self.rng);
        state.due = Some(due);
        state.phase = RevealPhase::Revealing;
        state.pending_tick()
    }

    /// Called once the stream completed. Finishes a parked reveal or keeps a running one going.
    pub fn on_finalized(&mut self, message_id: MessageId, text: &str, now: Instant) -> TickOutcome {
        let Some(state) = self.states.get(&message_id) else {
            return TickOutcome::Stale;
        };

        if let Some(next) = state.pending_tick() {
            return TickOutcome::Advanced {
                displayed_chars: state.displayed_chars,
                next,
            };
        }

        if state.displayed_bytes >= text.len() {
            let displayed_chars = state.displayed_chars;
            self.states.remove(&message_id);
            return TickOutcome::Completed { displayed_chars };
        }

        match self.on_growth(message_id, text, now) {
            Some(next) => TickOutcome::Advanced {
                displayed_chars: self.states.get(&message_id).map_or(0, |s| s.displayed_chars),
                next,
            },
            None => TickOutcome::Stale,
        }
    }

    /// Advances the reveal that owns `tick` by one character of the live `text`.
    pub fn fire(
        &mut self,
        tick: ScheduledTick,
        text: &str,
        finalized: bool,
        now: Instant,
    ) -> TickOutcome {
        let Some(state) = self.states.get_mut(&tick.message_id) else {
            return TickOutcome::Stale;
        };
        if state.generation != tick.generation || state.due != Some(tick.due) {
            return TickOutcome::Stale;
        }
        state.due = None;

        if let Some(next_char) = text
            .get(state.displayed_bytes..)
            .and_then(|rest| rest.chars().next())
        {
            state.displayed_bytes += next_char.len_utf8();
            state.displayed_chars += 1;
        }

        let displayed_chars = state.displayed_chars;
        if state.displayed_bytes < text.len() {
            let due = now + self.pacing.sample(&mut self.rng);
            state.due = Some(due);
            state.phase = RevealPhase::Revealing;
            return TickOutcome::Advanced {
                displayed_chars,
                next: ScheduledTick { due, ..tick },
            };
        }

        if finalized {
            self.states.remove(&tick.message_id);
            TickOutcome::Completed { displayed_chars }
        } else {
            state.phase = RevealPhase::CaughtUp;
            TickOutcome::CaughtUp { displayed_chars }
        }
    }

    /// Ends a reveal at once, e.g. because its message failed and is shown in full.
    pub fn short_circuit(&mut self, message_id: MessageId) -> bool {
        self.states.remove(&message_id).is_some()
    }

    /// Drops a reveal whose message was discarded. Its pending tick becomes stale.
    pub fn discard(&mut self, message_id: MessageId) -> bool {
        self.states.remove(&message_id).is_some()
    }

    pub fn discard_all(&mut self) -> usize {
        let discarded = self.states.len();
        self.states.clear();
        discarded
    }
}

impl Default for Typewriter {
    fn default() -> Self {
        Self::new(RevealPacing::default())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ID: MessageId = MessageId::new(1);

    fn typewriter() -> Typewriter {
        Typewriter::with_seed(RevealPacing::default(), 7)
    }

    /// Fires pending ticks until the reveal parks or completes.
    fn drain(typewriter: &mut Typewriter, text: &str, finalized: bool) -> Vec<TickOutcome> {
        let mut outcomes = Vec::new();
        while let Some(tick) = typewriter.next_tick() {
            let outcome = typewriter.fire(tick, text, finalized, tick.due);
            outcomes.push(outcome);
        }
        outcomes
    }

    #[test]
    fn pacing_orders_bounds_and_samples_within_them() {
        let pacing = RevealPacing::from_millis(50, 20);
        assert_eq!(pacing.min_delay(), Duration::from_millis(20));
        assert_eq!(pacing.max_delay(), Duration::from_millis(50));

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let delay = pacing.sample(&mut rng);
            assert!(delay >= pacing.min_delay() && delay <= pacing.max_delay());
        }

        let fixed = RevealPacing::from_millis(5, 5);
        assert_eq!(fixed.sample(&mut rng), Duration::from_millis(5));
    }

    #[test]
    fn begins_idle_without_a_tick() {
        let mut typewriter = typewriter();
        typewriter.begin(ID);

        assert_eq!(typewriter.phase(ID), RevealPhase::Idle);
        assert_eq!(typewriter.next_tick(), None);
        assert_eq!(typewriter.on_growth(ID, "", Instant::now()), None);
    }

    #[test]
    fn reveals_growing_text_then_parks_and_rearms() {
        let mut typewriter = typewriter();
        typewriter.begin(ID);
        let now = Instant::now();

        let first = typewriter.on_growth(ID, "Hi", now).unwrap();
        assert!(first.due >= now + DEFAULT_MIN_REVEAL_DELAY);
        assert!(first.due <= now + DEFAULT_MAX_REVEAL_DELAY);
        assert_eq!(typewriter.phase(ID), RevealPhase::Revealing);
        // Already armed; growth does not stack a second tick.
        assert_eq!(typewriter.on_growth(ID, "Hi!", now), None);

        let outcomes = drain(&mut typewriter, "Hi", false);
        assert_eq!(
            outcomes.last(),
            Some(&TickOutcome::CaughtUp { displayed_chars: 2 })
        );
        assert_eq!(typewriter.phase(ID), RevealPhase::CaughtUp);
        assert_eq!(typewriter.next_tick(), None);

        assert!(typewriter.on_growth(ID, "Hi there", now).is_some());
        let outcomes = drain(&mut typewriter, "Hi there", true);
        assert_eq!(outcomes.len(), 6);
        assert_eq!(
            outcomes.last(),
            Some(&TickOutcome::Completed { displayed_chars: 8 })
        );
        assert_eq!(typewriter.phase(ID), RevealPhase::Done);
        assert_eq!(typewriter.active_count(), 0);
    }

    #[test]
    fn finalizing_a_parked_reveal_completes_it() {
        let mut typewriter = typewriter();
        typewriter.begin(ID);
        let now = Instant::now();

        typewriter.on_growth(ID, "ok", now);
        drain(&mut typewriter, "ok", false);
        assert_eq!(typewriter.phase(ID), RevealPhase::CaughtUp);

        assert_eq!(
            typewriter.on_finalized(ID, "ok", now),
            TickOutcome::Completed { displayed_chars: 2 }
        );
        assert_eq!(typewriter.on_finalized(ID, "ok", now), TickOutcome::Stale);
    }

    #[test]
    fn empty_final_reply_completes_immediately() {
        let mut typewriter = typewriter();
        typewriter.begin(ID);
        assert_eq!(
            typewriter.on_finalized(ID, "", Instant::now()),
            TickOutcome::Completed { displayed_chars: 0 }
        );
    }

    #[test]
    fn advances_by_whole_characters() {
        let mut typewriter = typewriter();
        typewriter.begin(ID);
        let text = "¿né€";

        typewriter.on_growth(ID, text, Instant::now());
        let tick = typewriter.next_tick().unwrap();
        typewriter.fire(tick, text, true, tick.due);

        let state = typewriter.state(ID).unwrap();
        assert_eq!(state.displayed_chars(), 1);
        assert_eq!(state.displayed_bytes(), '¿'.len_utf8());

        drain(&mut typewriter, text, true);
        assert_eq!(typewriter.active_count(), 0);
    }

    #[test]
    fn discarded_reveal_ignores_its_pending_tick() {
        let mut typewriter = typewriter();
        typewriter.begin(ID);
        let tick = typewriter.on_growth(ID, "abc", Instant::now()).unwrap();

        assert!(typewriter.discard(ID));
        assert_eq!(typewriter.fire(tick, "abc", false, tick.due), TickOutcome::Stale);
        assert_eq!(typewriter.next_tick(), None);
    }

    #[test]
    fn superseded_generation_and_replayed_ticks_are_stale() {
        let mut typewriter = typewriter();
        let old_generation = typewriter.begin(ID);
        let old_tick = typewriter.on_growth(ID, "abc", Instant::now()).unwrap();

        let new_generation = typewriter.begin(ID);
        assert_ne!(old_generation, new_generation);
        assert_eq!(
            typewriter.fire(old_tick, "abc", false, old_tick.due),
            TickOutcome::Stale
        );
        assert_eq!(typewriter.state(ID).map(RevealState::displayed_chars), Some(0));

        let tick = typewriter.on_growth(ID, "abc", Instant::now()).unwrap();
        assert!(matches!(
            typewriter.fire(tick, "abc", false, tick.due),
            TickOutcome::Advanced { .. }
        ));
        // Handling the same tick twice must not advance twice.
        assert_eq!(typewriter.fire(tick, "abc", false, tick.due), TickOutcome::Stale);
        assert_eq!(typewriter.state(ID).map(RevealState::displayed_chars), Some(1));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Grow(String),
        Tick,
        Finalize,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            "[a-zé€ ]{0,4}".prop_map(Step::Grow),
            Just(Step::Tick),
            Just(Step::Tick),
            Just(Step::Finalize),
        ]
    }

    proptest! {
        #[test]
        fn cursor_is_monotone_bounded_and_converges(steps in proptest::collection::vec(step(), 0..60)) {
            let mut typewriter = typewriter();
            typewriter.begin(ID);
            let mut text = String::new();
            let mut finalized = false;
            let mut completed = 0;
            let mut last_shown = 0;
            let now = Instant::now();

            for step in steps {
                match step {
                    Step::Grow(fragment) if !finalized => {
                        text.push_str(&fragment);
                        typewriter.on_growth(ID, &text, now);
                    }
                    Step::Grow(_) => {}
                    Step::Tick => {
                        if let Some(tick) = typewriter.next_tick() {
                            let outcome = typewriter.fire(tick, &text, finalized, tick.due);
                            if let TickOutcome::Completed { .. } = outcome {
                                completed += 1;
                            }
                        }
                    }
                    Step::Finalize if !finalized => {
                        finalized = true;
                        if let TickOutcome::Completed { .. } = typewriter.on_finalized(ID, &text, now) {
                            completed += 1;
                        }
                    }
                    Step::Finalize => {}
                }

                if let Some(state) = typewriter.state(ID) {
                    prop_assert!(state.displayed_chars() >= last_shown);
                    prop_assert!(state.displayed_bytes() <= text.len());
                    prop_assert!(text.is_char_boundary(state.displayed_bytes()));
                    last_shown = state.displayed_chars();
                }
            }

            if !finalized {
                if let TickOutcome::Completed { .. } = typewriter.on_finalized(ID, &text, now) {
                    completed += 1;
                }
            }

            let mut ticks = 0;
            while let Some(tick) = typewriter.next_tick() {
                ticks += 1;
                prop_assert!(ticks <= text.chars().count());
                if let TickOutcome::Completed { displayed_chars } = typewriter.fire(tick, &text, true, tick.due) {
                    prop_assert_eq!(displayed_chars, text.chars().count());
                    completed += 1;
                }
            }

            prop_assert_eq!(completed, 1);
            prop_assert_eq!(typewriter.active_count(), 0);
            prop_assert_eq!(typewriter.next_tick(), None);
        }
    }
}

//! Transcript aggregation for the live conversation
//!
//! Merges incremental speech-to-text fragments into per-speaker turns.
//! Fragments for a speaker append to that speaker's open item; a
//! turn-complete signal finalizes every open item at once.
//!
//! The log is append/mutate-only: items are never deleted, and their order
//! matches the arrival order of first fragments, not finalization order.

/// Who produced a transcript item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    Agent,
    System,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Agent => "agent",
            Speaker::System => "system",
        }
    }
}

/// One turn of the conversation
///
/// Mutable (text grows) while `is_final` is false; immutable once finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptItem {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

/// Aggregates transcript fragments into per-speaker turns
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    items: Vec<TranscriptItem>,
    /// Count of fragments processed, for periodic logging
    fragment_count: u64,
}

impl TranscriptAggregator {
    /// Create a new empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Process an incoming transcript fragment
    ///
    /// Appends to the speaker's open item if one exists, otherwise starts a
    /// new item. Returns the index of the item that was updated.
    pub fn push_fragment(&mut self, speaker: Speaker, fragment: &str) -> usize {
        self.fragment_count += 1;
        if self.fragment_count % 20 == 0 {
            log::debug!(
                "TranscriptAggregator: {} fragments across {} items",
                self.fragment_count,
                self.items.len()
            );
        }

        if let Some(index) = self.open_item_index(speaker) {
            self.items[index].text.push_str(fragment);
            return index;
        }

        self.items.push(TranscriptItem {
            speaker,
            text: fragment.to_string(),
            is_final: false,
        });
        self.items.len() - 1
    }

    /// Finalize every open item on a turn-complete signal
    ///
    /// After this call the next fragment for any speaker starts a new item.
    pub fn complete_turn(&mut self) {
        let mut finalized = 0usize;
        for item in self.items.iter_mut().filter(|i| !i.is_final) {
            item.is_final = true;
            finalized += 1;
        }
        if finalized > 0 {
            log::debug!("TranscriptAggregator: turn complete, {} items finalized", finalized);
        }
    }

    /// The full transcript log, in first-fragment arrival order
    pub fn items(&self) -> &[TranscriptItem] {
        &self.items
    }

    /// Check if any item (open or final) exists
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the most recent non-final item for this speaker, if any
    fn open_item_index(&self, speaker: Speaker) -> Option<usize> {
        self.items
            .iter()
            .rposition(|item| item.speaker == speaker && !item.is_final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_aggregator_is_empty() {
        let agg = TranscriptAggregator::new();
        assert!(agg.is_empty());
        assert!(agg.items().is_empty());
    }

    #[test]
    fn test_fragments_accumulate_into_one_turn() {
        let mut agg = TranscriptAggregator::new();
        agg.push_fragment(Speaker::User, "Beli");
        agg.push_fragment(Speaker::User, " kopi");
        agg.complete_turn();

        assert_eq!(agg.items().len(), 1);
        assert_eq!(
            agg.items()[0],
            TranscriptItem {
                speaker: Speaker::User,
                text: "Beli kopi".to_string(),
                is_final: true,
            }
        );
    }

    #[test]
    fn test_speakers_get_separate_items() {
        let mut agg = TranscriptAggregator::new();
        agg.push_fragment(Speaker::User, "Beli kopi");
        agg.push_fragment(Speaker::Agent, "Dicatat, ");
        agg.push_fragment(Speaker::Agent, "kopi berapa?");

        assert_eq!(agg.items().len(), 2);
        assert_eq!(agg.items()[0].speaker, Speaker::User);
        assert_eq!(agg.items()[1].text, "Dicatat, kopi berapa?");
    }

    #[test]
    fn test_new_item_after_turn_complete() {
        let mut agg = TranscriptAggregator::new();
        agg.push_fragment(Speaker::User, "First turn");
        agg.complete_turn();
        agg.push_fragment(Speaker::User, "Second turn");

        assert_eq!(agg.items().len(), 2);
        assert!(agg.items()[0].is_final);
        assert!(!agg.items()[1].is_final);
        assert_eq!(agg.items()[1].text, "Second turn");
    }

    #[test]
    fn test_log_order_is_first_fragment_arrival_order() {
        let mut agg = TranscriptAggregator::new();
        agg.push_fragment(Speaker::User, "A");
        agg.push_fragment(Speaker::Agent, "B");
        agg.push_fragment(Speaker::User, "C");
        agg.complete_turn();

        // User's second fragment appended to the first item, so log order
        // stays [user, agent] regardless of interleaving
        assert_eq!(agg.items().len(), 2);
        assert_eq!(agg.items()[0].text, "AC");
        assert_eq!(agg.items()[1].text, "B");
    }

    #[test]
    fn test_complete_turn_on_empty_log_is_noop() {
        let mut agg = TranscriptAggregator::new();
        agg.complete_turn();
        assert!(agg.is_empty());
    }

    #[test]
    fn test_finalized_items_never_mutate() {
        let mut agg = TranscriptAggregator::new();
        agg.push_fragment(Speaker::System, "Session started");
        agg.complete_turn();
        agg.push_fragment(Speaker::System, "New note");

        assert_eq!(agg.items()[0].text, "Session started");
        assert_eq!(agg.items()[1].text, "New note");
    }
}

use ditch_core::{ChatMessage, DialogTurn};
use std::collections::VecDeque;

/// Ordered turn history of one conversation.
///
/// Turns are only ever appended at the tail or evicted from the head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dialog {
    turns: VecDeque<DialogTurn>,
}

impl Dialog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &DialogTurn> {
        self.turns.iter()
    }

    /// Sum of `token_cost` over every turn.
    pub fn total_tokens(&self) -> i64 {
        self.turns.iter().map(|turn| turn.token_cost).sum()
    }

    /// Append a turn and return its index.
    pub fn push(&mut self, turn: DialogTurn) -> usize {
        self.turns.push_back(turn);
        self.turns.len() - 1
    }

    /// Returns false if `index` is out of range.
    pub fn set_token_cost(&mut self, index: usize, token_cost: i64) -> bool {
        match self.turns.get_mut(index) {
            Some(turn) => {
                turn.token_cost = token_cost;
                true
            }
            None => false,
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.turns.iter().map(DialogTurn::to_message).collect()
    }

    pub fn to_vec(&self) -> Vec<DialogTurn> {
        self.turns.iter().cloned().collect()
    }

    /// Evict the oldest turns until the summed cost fits into
    /// `max_tokens - reserved_tokens`, or the dialog is empty.
    ///
    /// Turns are removed whole, strictly from the front. The evicted turns
    /// are returned in their original order.
    pub fn trim(&mut self, max_tokens: u32, reserved_tokens: u32) -> Vec<DialogTurn> {
        let budget = i64::from(max_tokens) - i64::from(reserved_tokens);
        let mut tokens = self.total_tokens();
        let mut evicted = Vec::new();

        while tokens > budget {
            let Some(oldest) = self.turns.pop_front() else {
                break;
            };
            tokens -= oldest.token_cost;
            evicted.push(oldest);
        }

        evicted
    }
}

impl FromIterator<DialogTurn> for Dialog {
    fn from_iter<I: IntoIterator<Item = DialogTurn>>(iter: I) -> Self {
        Self {
            turns: iter.into_iter().collect(),
        }
    }
}

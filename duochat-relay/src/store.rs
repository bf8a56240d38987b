//! In-memory message history.
//!
//! The [`MessageStore`] keeps each conversation as a FIFO of
//! [`ChatMessage`]s in creation order. A message that cannot be pushed live
//! stays here until the recipient fetches the conversation. Each
//! conversation is capped; when the cap is exceeded the oldest message is
//! dropped.

use std::collections::{HashMap, VecDeque};

use duochat_proto::message::{ChatMessage, MessageId, NewMessage, UserId};
use tokio::sync::RwLock;

/// Default maximum number of messages kept per conversation.
const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Unordered pair of participants, normalized so `(a, b) == (b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConversationKey(UserId, UserId);

impl ConversationKey {
    fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<ConversationKey, VecDeque<ChatMessage>>,
    index: HashMap<MessageId, ConversationKey>,
}

impl Inner {
    fn find_mut(&mut self, id: MessageId) -> Option<&mut ChatMessage> {
        let key = self.index.get(&id)?;
        self.conversations
            .get_mut(key)?
            .iter_mut()
            .find(|m| m.id == id)
    }
}

/// Thread-safe conversation history with per-conversation FIFO eviction.
#[derive(Debug)]
pub struct MessageStore {
    inner: RwLock<Inner>,
    max_history: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    /// Creates an empty store with the default per-conversation limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store keeping at most `max_history` messages per
    /// conversation.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_history: max_history.max(1),
        }
    }

    /// Persists a new message from `sender` to `receiver` and returns it.
    pub async fn insert(&self, sender: &UserId, receiver: &UserId, body: NewMessage) -> ChatMessage {
        let message = ChatMessage::new(sender.clone(), receiver.clone(), body);
        let key = ConversationKey::new(sender, receiver);

        let mut inner = self.inner.write().await;
        inner.index.insert(message.id, key.clone());
        let history = inner.conversations.entry(key).or_default();
        history.push_back(message.clone());
        let evicted = if history.len() > self.max_history {
            history.pop_front()
        } else {
            None
        };
        if let Some(old) = evicted {
            inner.index.remove(&old.id);
        }
        drop(inner);
        message
    }

    /// Returns the conversation between `a` and `b` in creation order.
    pub async fn conversation(&self, a: &UserId, b: &UserId) -> Vec<ChatMessage> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(&ConversationKey::new(a, b))
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks every unseen message from `partner` to `reader` as seen.
    ///
    /// Returns how many messages changed.
    pub async fn mark_conversation_seen(&self, reader: &UserId, partner: &UserId) -> usize {
        let mut inner = self.inner.write().await;
        let Some(history) = inner
            .conversations
            .get_mut(&ConversationKey::new(reader, partner))
        else {
            return 0;
        };
        let mut changed = 0;
        for msg in history
            .iter_mut()
            .filter(|m| !m.seen && &m.sender_id == partner && &m.receiver_id == reader)
        {
            msg.seen = true;
            changed += 1;
        }
        changed
    }

    /// Marks one message as seen, returning its updated value.
    pub async fn mark_seen(&self, id: MessageId) -> Option<ChatMessage> {
        let mut inner = self.inner.write().await;
        let msg = inner.find_mut(id)?;
        msg.seen = true;
        Some(msg.clone())
    }

    /// Looks up a message by id.
    pub async fn get(&self, id: MessageId) -> Option<ChatMessage> {
        let inner = self.inner.read().await;
        let key = inner.index.get(&id)?;
        inner
            .conversations
            .get(key)?
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Counts unseen messages addressed to `user`, grouped by sender.
    ///
    /// Senders with nothing unseen are omitted.
    pub async fn unseen_counts(&self, user: &UserId) -> HashMap<UserId, usize> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for msg in inner
            .conversations
            .iter()
            .filter(|(key, _)| &key.0 == user || &key.1 == user)
            .flat_map(|(_, history)| history.iter())
            .filter(|m| !m.seen && &m.receiver_id == user)
        {
            *counts.entry(msg.sender_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Total number of stored messages.
    pub async fn len(&self) -> usize {
        self.inner.read().await.index.len()
    }

    /// Returns `true` if no messages are stored.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.index.is_empty()
    }
}

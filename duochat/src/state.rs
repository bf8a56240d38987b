//! Client-side chat state.
//!
//! [`ChatState`] is the view model behind the conversation list and the
//! open conversation. It is fed by HTTP responses and by [`ServerEvent`]s
//! from the socket, and tells the caller which follow-up requests to make
//! through [`Action`].

use std::collections::{HashMap, HashSet, VecDeque};

use duochat_proto::api::UserProfile;
use duochat_proto::event::ServerEvent;
use duochat_proto::message::{ChatMessage, MessageId, Timestamp, UserId};
use duochat_proto::presence::UserStatus;

/// Default number of recently applied message ids remembered for
/// duplicate suppression.
const DEFAULT_MAX_DUPLICATE_TRACKING: usize = 10_000;

/// Follow-up request the caller should make after [`ChatState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A message from the open conversation arrived; tell the server it was read.
    MarkSeen(MessageId),
    /// A message arrived for another conversation; reload the user list.
    RefreshUsers,
}

/// Bounded set of recently applied message ids, evicting the oldest.
#[derive(Debug)]
struct RecentIds {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    cap: usize,
}

impl RecentIds {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Records `id`; returns `false` if it was already present.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.cap
            && let Some(old) = self.order.pop_front()
        {
            self.set.remove(&old);
        }
        true
    }
}

/// View model of one signed-in user's chats.
#[derive(Debug)]
pub struct ChatState {
    me: UserId,
    users: Vec<UserProfile>,
    unseen: HashMap<UserId, usize>,
    selected: Option<UserId>,
    messages: Vec<ChatMessage>,
    online: HashSet<UserId>,
    last_seen: HashMap<UserId, Timestamp>,
    applied: RecentIds,
}

impl ChatState {
    /// Creates an empty state for `me`.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self::with_duplicate_tracking(me, DEFAULT_MAX_DUPLICATE_TRACKING)
    }

    /// Creates an empty state remembering at most `cap` message ids for
    /// duplicate suppression.
    #[must_use]
    pub fn with_duplicate_tracking(me: UserId, cap: usize) -> Self {
        Self {
            me,
            users: Vec::new(),
            unseen: HashMap::new(),
            selected: None,
            messages: Vec::new(),
            online: HashSet::new(),
            last_seen: HashMap::new(),
            applied: RecentIds::new(cap),
        }
    }

    /// Known conversation partners, sorted by id.
    #[must_use]
    pub fn users(&self) -> &[UserProfile] {
        &self.users
    }

    /// The open conversation's partner.
    #[must_use]
    pub const fn selected(&self) -> Option<&UserId> {
        self.selected.as_ref()
    }

    /// Messages of the open conversation, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Unseen messages from `user`.
    #[must_use]
    pub fn unseen_from(&self, user: &UserId) -> usize {
        self.unseen.get(user).copied().unwrap_or(0)
    }

    /// Replaces the user list and unseen counters with a server snapshot.
    ///
    /// The open conversation's counter stays at zero.
    pub fn set_users(&mut self, mut users: Vec<UserProfile>, unseen: HashMap<UserId, usize>) {
        users.retain(|u| u.id != self.me);
        users.sort_by(|a, b| a.id.cmp(&b.id));
        self.users = users;
        self.unseen = unseen;
        self.unseen.retain(|_, count| *count > 0);
        if let Some(selected) = &self.selected {
            self.unseen.remove(selected);
        }
    }

    /// Replaces the roster.
    pub fn set_online(&mut self, roster: Vec<UserId>) {
        self.online = roster.into_iter().collect();
    }

    /// Online flag and last activity of every known partner, in list order.
    #[must_use]
    pub fn statuses(&self) -> Vec<(UserId, UserStatus)> {
        self.users
            .iter()
            .map(|u| {
                let status = UserStatus {
                    online: self.online.contains(&u.id),
                    last_seen: self.last_seen.get(&u.id).copied(),
                };
                (u.id.clone(), status)
            })
            .collect()
    }

    /// Opens the conversation with `user`, clearing its unseen counter.
    ///
    /// The message list is emptied until [`ChatState::set_messages`] loads it.
    pub fn select(&mut self, user: UserId) {
        self.unseen.remove(&user);
        if self.selected.as_ref() != Some(&user) {
            self.messages.clear();
        }
        self.selected = Some(user);
    }

    /// Loads the open conversation's history.
    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        for msg in &messages {
            self.applied.insert(msg.id);
            self.touch(msg);
        }
        self.messages = messages;
    }

    /// Appends a message this user just sent. Returns `false` if it is
    /// already shown.
    pub fn push_sent(&mut self, message: ChatMessage) -> bool {
        if !self.applied.insert(message.id) {
            return false;
        }
        self.touch(&message);
        if self.selected.as_ref() == Some(&message.receiver_id) {
            self.messages.push(message);
        }
        true
    }

    /// Applies one server event.
    pub fn apply(&mut self, event: ServerEvent) -> Option<Action> {
        match event {
            ServerEvent::OnlineUsers(roster) => {
                self.set_online(roster);
                None
            }
            ServerEvent::NewMessage(message) | ServerEvent::MessageReceived(message) => {
                self.incoming(message)
            }
            ServerEvent::MessagesSeen { by } => {
                for msg in self
                    .messages
                    .iter_mut()
                    .filter(|m| m.sender_id == self.me && m.receiver_id == by)
                {
                    msg.seen = true;
                }
                None
            }
            ServerEvent::MessageSeen { message_id } => {
                if let Some(msg) = self.messages.iter_mut().find(|m| m.id == message_id) {
                    msg.seen = true;
                }
                None
            }
            ServerEvent::Pong | ServerEvent::Error { .. } => None,
        }
    }

    fn incoming(&mut self, mut message: ChatMessage) -> Option<Action> {
        if message.sender_id != self.me && message.receiver_id != self.me {
            tracing::debug!(message_id = %message.id, "ignoring message for another user");
            return None;
        }
        if !self.applied.insert(message.id) {
            tracing::trace!(message_id = %message.id, "duplicate message ignored");
            return None;
        }
        self.touch(&message);

        // Echo of our own send from another view.
        if message.sender_id == self.me {
            if self.selected.as_ref() == Some(&message.receiver_id) {
                self.messages.push(message);
            }
            return None;
        }

        if self.selected.as_ref() == Some(&message.sender_id) {
            message.seen = true;
            let id = message.id;
            self.messages.push(message);
            Some(Action::MarkSeen(id))
        } else {
            *self.unseen.entry(message.sender_id).or_insert(0) += 1;
            Some(Action::RefreshUsers)
        }
    }

    fn touch(&mut self, message: &ChatMessage) {
        let partner = message.partner_of(&self.me).clone();
        let entry = self.last_seen.entry(partner).or_insert(message.created_at);
        if *entry < message.created_at {
            *entry = message.created_at;
        }
    }
}

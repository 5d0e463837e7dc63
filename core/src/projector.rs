/// Conversation projections: pure derivations over a message collection.
/// Nothing here holds state; the same input always yields the same output.
use crate::message::Message;
use serde::Serialize;

/// The newest message exchanged with one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub peer: String,
    pub message: Message,
}

/// Messages exchanged between `user_a` and `user_b`, ascending by `sent_at`.
/// Equal timestamps keep their insertion order.
pub fn conversation_between(messages: &[Message], user_a: &str, user_b: &str) -> Vec<Message> {
    let mut conversation: Vec<Message> = messages
        .iter()
        .filter(|m| m.involves(user_a, user_b))
        .cloned()
        .collect();
    // sort_by_key is stable
    conversation.sort_by_key(|m| m.sent_at);
    conversation
}

/// For each peer, the message with the greatest `sent_at` exchanged with
/// `local_user`. Peers with no messages get no entry. On equal timestamps the
/// later insertion wins. Output follows the order of `peers`.
pub fn last_message_per_peer<S: AsRef<str>>(
    messages: &[Message],
    local_user: &str,
    peers: &[S],
) -> Vec<LastMessage> {
    peers
        .iter()
        .filter_map(|peer| {
            let peer = peer.as_ref();
            let mut latest: Option<&Message> = None;
            for m in messages.iter().filter(|m| m.involves(local_user, peer)) {
                match latest {
                    Some(current) if m.sent_at < current.sent_at => {}
                    _ => latest = Some(m),
                }
            }
            latest.map(|m| LastMessage {
                peer: peer.to_string(),
                message: m.clone(),
            })
        })
        .collect()
}

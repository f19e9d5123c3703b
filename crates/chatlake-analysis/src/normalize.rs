//! Query row → prompt-ready message.

use chrono::{DateTime, Local, Utc};

use chatlake_core::types::CanonicalMessage;

use crate::reply::parse_refer_msg;
use crate::types::NormalizedMessage;

/// Longest excerpt of a referenced message shown in reply context.
const REPLY_EXCERPT_CHARS: usize = 30;

/// Normalize one canonical message for prompting.
///
/// Sender resolution prefers `chatroom_sender` for chatroom traffic; display
/// time is local wall clock; newlines collapse to spaces; a resolved reply
/// reference folds into the content as
/// `[Reply @<displayname>: <excerpt>] <reply-text>`.
pub fn normalize(msg: &CanonicalMessage) -> NormalizedMessage {
    let sender = if msg.is_chatroom_msg && !msg.chatroom_sender.is_empty() {
        msg.chatroom_sender.clone()
    } else {
        msg.from_user.clone()
    };

    let time_display = DateTime::<Utc>::from_timestamp(msg.create_time, 0)
        .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "00:00".to_string());

    let refer = parse_refer_msg(&msg.content);
    let content = match &refer {
        Some(refer) => format!(
            "[Reply @{}: {}] {}",
            refer.displayname,
            excerpt(&refer.content),
            clean(&refer.title)
        ),
        None => clean(&msg.content),
    };

    NormalizedMessage {
        msg_id: msg.msg_id.clone(),
        sender,
        time_display,
        content,
        refer,
        create_time: msg.create_time,
    }
}

fn clean(text: &str) -> String {
    text.replace(['\n', '\r'], " ").trim().to_string()
}

fn excerpt(text: &str) -> String {
    let cleaned = clean(text);
    if cleaned.chars().count() <= REPLY_EXCERPT_CHARS {
        return cleaned;
    }
    cleaned.chars().take(REPLY_EXCERPT_CHARS).collect()
}

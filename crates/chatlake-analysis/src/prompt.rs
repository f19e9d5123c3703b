//! Prompt rendering for the topic-analysis model calls.

/// Sentinel opening the fenced result section.
pub const RESULT_START: &str = "<<<RESULT_START>>>";
/// Sentinel closing it.
pub const RESULT_END: &str = "<<<RESULT_END>>>";

/// Role-establishing system prompt: what the analyst does, how threads are
/// split, and the exact output protocol the parser expects.
pub fn system_prompt() -> String {
    format!(
        "You are a chat-log analyst. You receive one day of messages from a \
single chatroom, one message per line in the form \
`[<msg_id>] <HH:MM> <sender>: <content>`.\n\
\n\
Split the conversation into topic threads. Group messages by:\n\
1. Explicit reply relations (lines containing `[Reply @...]`) — these have \
the highest priority and always bind a message to the thread it replies to.\n\
2. Question-answer pairing.\n\
3. Semantic similarity of content.\n\
4. Time proximity — long silent gaps usually separate threads.\n\
\n\
Respond with the topics between the exact sentinel lines below, one blank \
line between topics, each topic as `field: value` pairs:\n\
\n\
{RESULT_START}\n\
title: <short thread title>\n\
summary: <100-200 character summary>\n\
keywords: <comma-separated keywords>\n\
participants: <comma-separated senders>\n\
message_ids: <comma-separated msg_ids covering every message in the thread>\n\
confidence: <0.0-1.0>\n\
time_range: <HH:MM-HH:MM>\n\
notes: <anything noteworthy, or leave empty>\n\
{RESULT_END}\n\
\n\
Output nothing outside the sentinels. Do not use JSON."
    )
}

/// User prompt carrying the rendered display lines.
pub fn user_prompt(lines: &[String]) -> String {
    format!(
        "Analyse the following {count} messages and produce the topic \
threads. Every message id must appear in exactly one topic's message_ids.\n\
\n\
{body}",
        count = lines.len(),
        body = lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_describes_protocol() {
        let p = system_prompt();
        assert!(p.contains(RESULT_START));
        assert!(p.contains(RESULT_END));
        assert!(p.contains("message_ids"));
        assert!(p.contains("Reply @"));
    }

    #[test]
    fn user_prompt_carries_all_lines() {
        let lines = vec![
            "[m1] 09:00 alice: hi".to_string(),
            "[m2] 09:01 bob: hello".to_string(),
        ];
        let p = user_prompt(&lines);
        assert!(p.contains("2 messages"));
        assert!(p.contains("[m1] 09:00 alice: hi"));
        assert!(p.contains("[m2] 09:01 bob: hello"));
    }
}

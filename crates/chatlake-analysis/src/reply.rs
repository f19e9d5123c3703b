//! Reply-chain extraction from message content.
//!
//! Certain messages embed an XML payload whose `<appmsg>` carries
//! `<type>57</type>` and a `<refermsg>` element referencing an earlier
//! message. The parser is total: anything that is not exactly that shape
//! (including non-XML content and torn documents) yields `None`, never an
//! error — malformed payloads must not interrupt the pipeline.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::types::ReferMsg;

/// Payload type value that marks a reply message.
const REPLY_TYPE: i32 = 57;

#[derive(Default)]
struct Collected {
    appmsg_type: Option<i32>,
    title: String,
    refer_type: Option<i32>,
    svrid: String,
    displayname: String,
    content: String,
    createtime: Option<i64>,
}

/// Extract the reply reference from a message's `content`, if present.
pub fn parse_refer_msg(content: &str) -> Option<ReferMsg> {
    if !content.contains("<refermsg>") {
        return None;
    }

    let mut reader = Reader::from_str(content);
    let mut path: Vec<String> = Vec::new();
    let mut collected = Collected::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let value = text.unescape().ok()?.into_owned();
                record_text(&mut collected, &path, &value);
            }
            Ok(Event::CData(data)) => {
                let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                record_text(&mut collected, &path, &value);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    if collected.appmsg_type != Some(REPLY_TYPE) || collected.svrid.is_empty() {
        return None;
    }
    Some(ReferMsg {
        svrid: collected.svrid,
        refer_type: collected.refer_type.unwrap_or(0),
        content: collected.content,
        displayname: collected.displayname,
        createtime: collected.createtime.unwrap_or(0),
        title: collected.title,
    })
}

fn record_text(collected: &mut Collected, path: &[String], value: &str) {
    let under_appmsg = path.iter().any(|p| p == "appmsg");
    let under_refer = path.iter().any(|p| p == "refermsg");
    let Some(leaf) = path.last() else {
        return;
    };

    match (under_appmsg, under_refer, leaf.as_str()) {
        (true, false, "type") => collected.appmsg_type = value.trim().parse().ok(),
        (true, false, "title") => collected.title = value.to_string(),
        (_, true, "type") => collected.refer_type = value.trim().parse().ok(),
        (_, true, "svrid") => collected.svrid = value.trim().to_string(),
        (_, true, "displayname") => collected.displayname = value.to_string(),
        (_, true, "content") => collected.content = value.to_string(),
        (_, true, "createtime") => collected.createtime = value.trim().parse().ok(),
        _ => {}
    }
}

//! Streaming parser for hub notification feeds.
//!
//! Extracts `(videoId, channelId, title)` per `entry` element. Element
//! names are matched by local name, so namespace prefixes do not matter.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::Result;

/// One feed entry of a push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
}

/// Parse an Atom notification body into its entries.
///
/// Entries missing a video or channel id are dropped; malformed XML is an
/// error.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut in_entry = false;
    let mut element_stack: Vec<String> = Vec::new();
    let mut current_text = String::new();
    let mut video_id: Option<String> = None;
    let mut channel_id: Option<String> = None;
    let mut title: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = local_name(e.local_name().as_ref())?;
                if name == "entry" {
                    in_entry = true;
                    video_id = None;
                    channel_id = None;
                    title = None;
                }
                element_stack.push(name);
                current_text.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = std::str::from_utf8(e)
                    .map_err(|e| crate::Error::Feed(format!("Invalid UTF-8 in feed text: {}", e)))?;
                current_text.push_str(text);
            }
            Ok(Event::End(_)) => {
                let name = element_stack.pop().unwrap_or_default();
                if in_entry {
                    match name.as_str() {
                        "videoId" => video_id = Some(current_text.trim().to_string()),
                        "channelId" => channel_id = Some(current_text.trim().to_string()),
                        "title" => title = Some(current_text.trim().to_string()),
                        "entry" => {
                            in_entry = false;
                            if let (Some(video_id), Some(channel_id)) =
                                (video_id.take(), channel_id.take())
                            {
                                entries.push(FeedEntry {
                                    video_id,
                                    channel_id,
                                    title: title.take().unwrap_or_default(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(crate::Error::Feed(format!("Invalid feed XML: {}", e))),
        }
    }

    Ok(entries)
}

fn local_name(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| crate::Error::Feed(format!("Invalid UTF-8 in element name: {}", e)))
}

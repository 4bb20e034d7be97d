//! Frame-to-event decoding

use crate::{
    constants::HEADER_TERMINATOR,
    error::{EslError, EslResult},
    event::EslEvent,
    headers::{ContentType, Header},
    protocol::{self, Frame},
};

/// Turns raw frame bytes into an [`EslEvent`].
///
/// Implementations must not touch any transport; a decode failure only
/// aborts processing of that one frame.
pub trait Decoder: Send + Sync + 'static {
    /// Decode one complete frame.
    fn decode(&self, frame: &[u8]) -> EslResult<EslEvent>;
}

impl<F> Decoder for F
where
    F: Fn(&[u8]) -> EslResult<EslEvent> + Send + Sync + 'static,
{
    fn decode(&self, frame: &[u8]) -> EslResult<EslEvent> {
        self(frame)
    }
}

/// Default decoder for FreeSWITCH frames.
///
/// Chooses the body format from the outer `Content-Type`:
/// - `text/event-plain`: body holds percent-encoded event headers, optionally
///   followed by a blank line and an inner body
/// - `text/event-json`: body is a JSON object, `_body` becomes the event body
/// - `text/event-xml`: `<event><headers>…</headers><body>…</body></event>`
/// - anything else: the outer headers are the event headers and the frame
///   body is the event body
#[derive(Debug, Clone, Copy, Default)]
pub struct EslDecoder;

impl EslDecoder {
    pub fn new() -> Self {
        Self
    }

    fn body_text(frame: &Frame) -> EslResult<Option<&str>> {
        match frame.body() {
            [] => Ok(None),
            bytes => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| EslError::decode("invalid UTF-8 in body")),
        }
    }

    /// Plain text event
    ///
    /// FreeSWITCH text/event-plain wire format uses a two-part structure:
    /// - Outer envelope: Content-Length + Content-Type headers
    /// - Body: URL-encoded key: value lines (the actual event headers)
    fn decode_plain(&self, body: Option<&str>) -> EslResult<EslEvent> {
        let body = body.ok_or_else(|| EslError::decode("plain event missing body"))?;

        let (header_section, inner_body) = match body.find(HEADER_TERMINATOR) {
            Some(pos) => (&body[..pos], Some(&body[pos + HEADER_TERMINATOR.len()..])),
            None => (body, None),
        };

        let mut event = EslEvent::new();
        for (key, value) in protocol::parse_headers(header_section)? {
            event.set_header(key, value);
        }

        if let Some(ib) = inner_body {
            if !ib.is_empty() {
                event.set_body(ib);
            }
        }

        Ok(event)
    }

    fn decode_json(&self, body: Option<&str>) -> EslResult<EslEvent> {
        let body = body.ok_or_else(|| EslError::decode("JSON event missing body"))?;

        let json_value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| EslError::decode(format!("invalid JSON event: {}", e)))?;
        let obj = json_value
            .as_object()
            .ok_or_else(|| EslError::decode("JSON event is not an object"))?;

        let mut event = EslEvent::new();
        for (key, value) in obj {
            let value_str = match value {
                serde_json::Value::String(s) => s.clone(),
                _ => value.to_string(),
            };
            if key == "_body" {
                event.set_body(value_str);
            } else {
                event.set_header(key.clone(), value_str);
            }
        }

        Ok(event)
    }

    fn decode_xml(&self, body: Option<&str>) -> EslResult<EslEvent> {
        use quick_xml::events::Event as XmlEvent;
        use quick_xml::Reader;

        let body = body.ok_or_else(|| EslError::decode("XML event missing body"))?;

        let mut reader = Reader::from_str(body);
        let mut event = EslEvent::new();
        let mut in_headers = false;
        let mut in_body = false;
        let mut current_tag: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(ref e)) => {
                    let tag = String::from_utf8_lossy(
                        e.name()
                            .as_ref(),
                    )
                    .to_string();
                    match tag.as_str() {
                        "headers" => in_headers = true,
                        "body" => in_body = true,
                        _ if in_headers => current_tag = Some(tag),
                        _ => {}
                    }
                }
                Ok(XmlEvent::End(ref e)) => {
                    match e
                        .name()
                        .as_ref()
                    {
                        b"headers" => in_headers = false,
                        b"body" => in_body = false,
                        _ if in_headers => current_tag = None,
                        _ => {}
                    }
                }
                Ok(XmlEvent::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| EslError::decode(format!("invalid XML text: {}", e)))?
                        .to_string();
                    if in_body {
                        event.set_body(text);
                    } else if let Some(ref tag) = current_tag {
                        event.set_header(tag.clone(), text);
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Err(e) => return Err(EslError::decode(format!("invalid XML event: {}", e))),
                _ => {}
            }
        }

        Ok(event)
    }
}

impl Decoder for EslDecoder {
    fn decode(&self, raw: &[u8]) -> EslResult<EslEvent> {
        let frame = Frame::from_bytes(raw);
        if frame.is_empty() {
            return Err(EslError::decode("empty frame"));
        }

        let outer = protocol::parse_headers(frame.header_block())?;
        let body = Self::body_text(&frame)?;
        let content_type = outer
            .get(Header::ContentType.as_str())
            .and_then(|ct| {
                ct.parse::<ContentType>()
                    .ok()
            });

        let mut event = match content_type {
            Some(ContentType::EventPlain) => self.decode_plain(body)?,
            Some(ContentType::EventJson) => self.decode_json(body)?,
            Some(ContentType::EventXml) => self.decode_xml(body)?,
            _ => {
                let mut event = EslEvent::new();
                for (key, value) in outer {
                    event.set_header(key, value);
                }
                if let Some(body) = body {
                    event.set_body(body);
                }
                event
            }
        };

        event.resolve_name();
        event.set_raw(raw.to_vec());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(content_type: &str, body: &str) -> String {
        format!(
            "Content-Length: {}\nContent-Type: {}\n\n{}",
            body.len(),
            content_type,
            body
        )
    }

    #[test]
    fn test_decode_plain_event() {
        let raw = envelope(
            "text/event-plain",
            "Event-Name: CHANNEL_ANSWER\nUnique-ID: test-uuid\n\n",
        );
        let event = EslDecoder
            .decode(raw.as_bytes())
            .unwrap();

        assert_eq!(event.name(), "CHANNEL_ANSWER");
        assert_eq!(event.unique_id(), Some("test-uuid"));
        assert_eq!(event.raw(), raw.as_bytes());
    }

    #[test]
    fn test_decode_plain_percent_decoding() {
        let raw = envelope(
            "text/event-plain",
            "Event-Name: HEARTBEAT\nUp-Time: 0%20years%2C%200%20days\nEvent-Info: System%20Ready\n\n",
        );
        let event = EslDecoder
            .decode(raw.as_bytes())
            .unwrap();

        assert_eq!(event.name(), "HEARTBEAT");
        assert_eq!(event.header("Up-Time"), Some("0 years, 0 days"));
        assert_eq!(event.header("Event-Info"), Some("System Ready"));
    }

    #[test]
    fn test_decode_plain_with_inner_body() {
        let inner_body = "+OK Status\n";
        let body = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: abc-123\nContent-Length: {}\n\n{}",
            inner_body.len(),
            inner_body
        );
        let raw = envelope("text/event-plain", &body);
        let event = EslDecoder
            .decode(raw.as_bytes())
            .unwrap();

        assert_eq!(event.name(), "BACKGROUND_JOB");
        assert_eq!(event.job_uuid(), Some("abc-123"));
        assert_eq!(event.body(), Some("+OK Status\n"));
    }

    #[test]
    fn test_decode_json_event() {
        let raw = envelope(
            "text/event-json",
            r#"{"Event-Name":"CHANNEL_CREATE","Unique-ID":"u-1","Channel-State-Number":2,"_body":"hello"}"#,
        );
        let event = EslDecoder
            .decode(raw.as_bytes())
            .unwrap();

        assert_eq!(event.name(), "CHANNEL_CREATE");
        assert_eq!(event.header("Channel-State-Number"), Some("2"));
        assert_eq!(event.body(), Some("hello"));
    }

    #[test]
    fn test_decode_xml_event_with_body() {
        let xml_body = "\
<event>\n\
  <headers>\n\
    <Event-Name>BACKGROUND_JOB</Event-Name>\n\
    <Job-UUID>def-456</Job-UUID>\n\
  </headers>\n\
  <body>+OK result data</body>\n\
</event>";
        let raw = envelope("text/event-xml", xml_body);
        let event = EslDecoder
            .decode(raw.as_bytes())
            .unwrap();

        assert_eq!(event.name(), "BACKGROUND_JOB");
        assert_eq!(event.job_uuid(), Some("def-456"));
        assert_eq!(event.body(), Some("+OK result data"));
    }

    #[test]
    fn test_decode_reply_uses_outer_headers() {
        let raw = "Content-Type: api/response\nContent-Length: 3\n\n+OK";
        let event = EslDecoder
            .decode(raw.as_bytes())
            .unwrap();

        assert_eq!(event.name(), "");
        assert_eq!(event.header("Content-Type"), Some("api/response"));
        assert_eq!(event.body(), Some("+OK"));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            EslDecoder.decode(b""),
            Err(EslError::Decode { .. })
        ));
        assert!(matches!(
            EslDecoder.decode(envelope("text/event-json", "{not json").as_bytes()),
            Err(EslError::Decode { .. })
        ));
        assert!(matches!(
            EslDecoder.decode(b"Content-Type: text/event-plain\n\n"),
            Err(EslError::Decode { .. })
        ));
        assert!(matches!(
            EslDecoder.decode(b"no colon here\n\n"),
            Err(EslError::Decode { .. })
        ));
    }

    #[test]
    fn test_closure_decoder() {
        let decoder = |_: &[u8]| -> EslResult<EslEvent> { Ok(EslEvent::with_name("FIXED")) };
        assert_eq!(
            decoder
                .decode(b"anything")
                .unwrap()
                .name(),
            "FIXED"
        );
    }
}

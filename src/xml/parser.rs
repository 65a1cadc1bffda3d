//! Incremental XML stream parser.
//!
//! Bytes read from the wire are appended to an internal buffer; every call
//! to [`Parser::next_event`] tries to cut one complete top-level element (or
//! the stream root open/close tag) from the front of the buffer.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::Element;

/// Something the parser recognised at stream level.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    /// Opening root tag, attributes only.
    StreamOpen(Element),
    /// A complete top-level element.
    Element(Element),
    /// `</stream:stream>` received.
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("stanza exceeds {0} bytes")]
    TooLargeStanza(usize),
    #[error("invalid xml: {0}")]
    InvalidXml(String),
}

/// Buffering stream parser.
#[derive(Debug)]
pub struct Parser {
    buffer: Vec<u8>,
    max_stanza_size: usize,
}

impl Parser {
    /// A `max_stanza_size` of zero disables the limit.
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_stanza_size,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drops any buffered input. Used on stream restarts.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete event, or `None` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        match extract_event(&self.buffer)? {
            Some((event, consumed)) => {
                if self.max_stanza_size > 0 && consumed > self.max_stanza_size {
                    return Err(ParseError::TooLargeStanza(self.max_stanza_size));
                }
                self.buffer.drain(..consumed);
                Ok(Some(event))
            }
            None => {
                if self.max_stanza_size > 0 && self.buffer.len() > self.max_stanza_size {
                    return Err(ParseError::TooLargeStanza(self.max_stanza_size));
                }
                Ok(None)
            }
        }
    }
}

/// Parses a single self-contained element (a WebSocket frame).
pub fn parse_element(text: &str) -> Result<Element, ParseError> {
    match extract_event(text.as_bytes())? {
        Some((ParseEvent::Element(elem), _)) => Ok(elem),
        Some((ParseEvent::StreamOpen(_), _)) | Some((ParseEvent::StreamClosed, _)) => Err(
            ParseError::InvalidXml("stream root not allowed in framed mode".to_string()),
        ),
        None => Err(ParseError::InvalidXml("incomplete element".to_string())),
    }
}

fn is_stream_root(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

fn invalid(e: impl std::fmt::Display) -> ParseError {
    ParseError::InvalidXml(e.to_string())
}

fn element_from_start(e: &BytesStart<'_>) -> Result<Element, ParseError> {
    let mut elem = Element::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(invalid)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(invalid)?;
        elem.set_attr(key, value.into_owned());
    }
    Ok(elem)
}

/// Tries to cut one event from the front of `buffer`.
///
/// Returns the event and the number of bytes it spans, or `None` when the
/// buffer holds an incomplete element.
fn extract_event(buffer: &[u8]) -> Result<Option<(ParseEvent, usize)>, ParseError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    // End names are matched against our own element stack: the root's
    // start tag is consumed by an earlier call.
    reader.config_mut().check_end_names = false;
    reader.config_mut().allow_unmatched_ends = true;

    let mut stack: Vec<Element> = Vec::new();

    loop {
        let event = reader.read_event();
        let pos = reader.buffer_position() as usize;

        match event {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if stack.is_empty() && is_stream_root(e.name().as_ref()) {
                    return Ok(Some((ParseEvent::StreamOpen(element_from_start(&e)?), pos)));
                }
                stack.push(element_from_start(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let elem = element_from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.append(elem),
                    None if is_stream_root(e.name().as_ref()) => {
                        return Ok(Some((ParseEvent::StreamOpen(elem), pos)));
                    }
                    None => return Ok(Some((ParseEvent::Element(elem), pos))),
                }
            }
            Ok(Event::Text(t)) => {
                let text = match t.unescape() {
                    Ok(text) => text,
                    // A partial entity reference at the end of the buffer.
                    Err(_) if pos >= buffer.len() => return Ok(None),
                    Err(e) => return Err(invalid(e)),
                };
                match stack.last_mut() {
                    Some(top) => top.append_text(&text),
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(ParseError::InvalidXml(
                            "character data outside of an element".to_string(),
                        ))
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.append_text(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                match stack.pop() {
                    None if is_stream_root(name.as_ref()) => {
                        return Ok(Some((ParseEvent::StreamClosed, pos)));
                    }
                    None => {
                        return Err(ParseError::InvalidXml(format!(
                            "unexpected end tag </{}>",
                            String::from_utf8_lossy(name.as_ref())
                        )))
                    }
                    Some(elem) => {
                        if elem.name().as_bytes() != name.as_ref() {
                            return Err(ParseError::InvalidXml(format!(
                                "mismatched end tag </{}>, expected </{}>",
                                String::from_utf8_lossy(name.as_ref()),
                                elem.name()
                            )));
                        }
                        match stack.last_mut() {
                            Some(parent) => parent.append(elem),
                            None => return Ok(Some((ParseEvent::Element(elem), pos))),
                        }
                    }
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Err(ParseError::InvalidXml("invalid markup".to_string()));
            }
            // Unclosed tags, comments, CDATA or declarations: the rest of
            // the element has not arrived yet.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(invalid(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(parser: &mut Parser) -> ParseEvent {
        parser.next_event().unwrap().unwrap()
    }

    #[test]
    fn test_stream_open() {
        let mut p = Parser::new(0);
        p.feed(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='jackal.im' version='1.0'>");
        match next(&mut p) {
            ParseEvent::StreamOpen(elem) => {
                assert_eq!(elem.name(), "stream:stream");
                assert_eq!(elem.attr_str("to"), "jackal.im");
                assert_eq!(elem.namespace(), "jabber:client");
                assert_eq!(elem.attr_str("xmlns:stream"), "http://etherx.jabber.org/streams");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(p.buffered(), 0);
    }

    #[test]
    fn test_nested_stanza_and_text() {
        let mut p = Parser::new(0);
        p.feed(b"<message to='a@b' type='chat'><body>Hello &amp; welcome</body></message>");
        match next(&mut p) {
            ParseEvent::Element(elem) => {
                assert_eq!(elem.name(), "message");
                assert_eq!(elem.find("body").unwrap().get_text(), "Hello & welcome");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_fragmented_input() {
        let mut p = Parser::new(0);
        p.feed(b"<iq type='get' id='1'><query xmlns='jabber:iq:roster'>");
        assert!(p.next_event().unwrap().is_none());
        p.feed(b"</query></iq><presence/>");
        match next(&mut p) {
            ParseEvent::Element(elem) => assert_eq!(elem.name(), "iq"),
            other => panic!("unexpected event {:?}", other),
        }
        match next(&mut p) {
            ParseEvent::Element(elem) => assert_eq!(elem.name(), "presence"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(p.next_event().unwrap().is_none());
    }

    #[test]
    fn test_partial_start_tag() {
        let mut p = Parser::new(0);
        p.feed(b"<presence ty");
        assert!(p.next_event().unwrap().is_none());
        p.feed(b"pe='unavailable'/>");
        assert!(matches!(next(&mut p), ParseEvent::Element(_)));
    }

    #[test]
    fn test_stream_close() {
        let mut p = Parser::new(0);
        p.feed(b"  </stream:stream>");
        assert_eq!(next(&mut p), ParseEvent::StreamClosed);
    }

    #[test]
    fn test_too_large_stanza() {
        let mut p = Parser::new(16);
        p.feed(b"<message><body>0123456789012345");
        assert_eq!(p.next_event(), Err(ParseError::TooLargeStanza(16)));
    }

    #[test]
    fn test_mismatched_end_tag() {
        let mut p = Parser::new(0);
        p.feed(b"<message><body>hi</message>");
        assert!(matches!(p.next_event(), Err(ParseError::InvalidXml(_))));
    }

    #[test]
    fn test_text_outside_element() {
        let mut p = Parser::new(0);
        p.feed(b"garbage<presence/>");
        assert!(matches!(p.next_event(), Err(ParseError::InvalidXml(_))));
    }

    #[test]
    fn test_cdata() {
        let mut p = Parser::new(0);
        p.feed(b"<message><body><![CDATA[a <raw> & b]]></body></message>");
        match next(&mut p) {
            ParseEvent::Element(elem) => {
                assert_eq!(elem.find("body").unwrap().get_text(), "a <raw> & b")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_element_frame() {
        let elem =
            parse_element(r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" to="jackal.im" version="1.0"/>"#)
                .unwrap();
        assert_eq!(elem.name(), "open");
        assert!(parse_element("<iq><query>").is_err());
    }

    #[test]
    fn test_serialize_parse_serialize_is_stable() {
        let xml = r#"<iq id="r1" type="set" to="jackal.im"><query xmlns="jabber:iq:roster"><item jid="noelia@jackal.im" name="My &quot;Juliet&quot;" subscription="none"><group>Friends &amp; co</group></item></query></iq>"#;
        let first = parse_element(xml).unwrap();
        let serialized = first.to_xml();
        assert_eq!(serialized, xml);
        let second = parse_element(&serialized).unwrap();
        assert_eq!(first, second);
    }
}

//! XML stream parser adapter (spec §4.2, component C2).
//!
//! Feeds bytes from a [`Read`](std::io::Read) into an incremental XML
//! tokenizer and turns the result into the four events the FSM
//! understands: the stream-opening tag, one complete top-level child
//! element, the stream's closing tag, or a tokenizer failure.
//!
//! Grounded on the pack's synchronous-transport shape
//! (`other_examples/.../aftershootco-xmpp-rs__src-transport.rs`, which reads
//! `xml::reader::XmlEvent`s off a blocking `TcpStream` and hands complete
//! `minidom::Element`s to its caller). We use the same `xml-rs` event reader
//! here, since unlike `minidom`'s own incremental reader it does not assume
//! the document root ever closes — exactly what an XMPP stream needs.

use std::io::Read;

use minidom::Element;
use xml::attribute::OwnedAttribute;
use xml::name::OwnedName;
use xml::reader::{EventReader, XmlEvent};

use crate::error::{Error, ProtocolError};

/// One event raised by the stream parser.
#[derive(Debug)]
pub enum StreamEvent {
    /// The opening `<stream:stream .../>` tag, with its attributes.
    StreamStart {
        /// Attributes on the opening tag (`to`, `id`, `version`, `xml:lang`, ...).
        attrs: Vec<(String, String)>,
    },
    /// One complete top-level child of the stream (a stanza or nonza).
    StreamElement(Element),
    /// The matching `</stream:stream>` close tag.
    StreamEnd,
}

/// Incremental XML parser wrapping a blocking byte source.
///
/// One instance is owned per live transport; [`reset`](StreamParser::reset)
/// must be called whenever a new `<stream:stream>` is opened on the same
/// underlying connection (after SASL success, STARTTLS `<proceed/>`, and
/// compression `<compressed/>`), per spec §4.2.
pub struct StreamParser<R: Read> {
    reader: EventReader<R>,
    /// Element subtree currently being assembled, innermost last.
    stack: Vec<Element>,
    /// True once the opening `<stream:stream>` tag has been seen.
    in_stream: bool,
}

impl<R: Read> StreamParser<R> {
    /// Wrap a fresh byte source. Call this (rather than mutating in place)
    /// whenever the transport itself is swapped out, e.g. after STARTTLS.
    pub fn new(source: R) -> Self {
        StreamParser {
            reader: EventReader::new(source),
            stack: Vec::new(),
            in_stream: false,
        }
    }

    /// Discard any in-flight parser state and start over on `source`. This
    /// is the "reset_parser" operation of spec §4.1/§4.2.
    pub fn reset(&mut self, source: R) {
        self.reader = EventReader::new(source);
        self.stack.clear();
        self.in_stream = false;
    }

    /// Block until the next structurally complete event is available.
    ///
    /// Returns `Ok(None)` on clean EOF (the peer closed the TCP connection
    /// without a `</stream:stream>`).
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, Error> {
        loop {
            let event = match self.reader.next() {
                Ok(ev) => ev,
                Err(e) => {
                    return Err(ProtocolError::MalformedXml(e.to_string()).into());
                }
            };
            match event {
                XmlEvent::StartDocument { .. } | XmlEvent::Whitespace(_) => continue,
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    if !self.in_stream {
                        self.in_stream = true;
                        return Ok(Some(StreamEvent::StreamStart {
                            attrs: owned_attrs(&attributes),
                        }));
                    }
                    self.stack.push(bare_element(&name, &attributes));
                }
                XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                    if let Some(top) = self.stack.last_mut() {
                        top.append_text_node(text);
                    }
                }
                XmlEvent::EndElement { .. } => {
                    match self.stack.pop() {
                        Some(finished) => match self.stack.last_mut() {
                            Some(parent) => {
                                parent.append_child(finished);
                            }
                            None => return Ok(Some(StreamEvent::StreamElement(finished))),
                        },
                        None => {
                            // Closing the <stream:stream> itself.
                            self.in_stream = false;
                            return Ok(Some(StreamEvent::StreamEnd));
                        }
                    }
                }
                XmlEvent::EndDocument => return Ok(None),
                _ => continue,
            }
        }
    }
}

fn owned_attrs(attrs: &[OwnedAttribute]) -> Vec<(String, String)> {
    attrs
        .iter()
        .map(|a| (a.name.local_name.clone(), a.value.clone()))
        .collect()
}

fn bare_element(name: &OwnedName, attrs: &[OwnedAttribute]) -> Element {
    let ns = name.namespace.clone().unwrap_or_default();
    let mut el = Element::bare(name.local_name.clone(), ns);
    for attr in attrs {
        el.set_attr(attr.name.local_name.clone(), attr.value.clone());
    }
    el
}

/// Read a single named attribute straight off a raw XML attribute slice.
/// Used by the FSM to peek at stream-open attributes before a full
/// [`Element`] tree exists for them.
pub fn find_attr(attrs: &[(String, String)], name: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

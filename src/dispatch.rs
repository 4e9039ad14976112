//! Stanza dispatcher (spec §4.4, component C6).
//!
//! Classifies a top-level stream element by local name and turns it into a
//! [`Notification`] for the owner, or into a signal the FSM itself must act
//! on (a stream error). Grounded on the teacher's `event.rs` `Stanza`/`Event`
//! split, but working over raw [`minidom::Element`] rather than typed
//! `xso` stanzas, since the dispatcher's whole job here is to stay generic
//! over payloads it doesn't otherwise understand (spec §4.4: "Anything else
//! ... forward as raw").

use minidom::Element;

const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

/// The kind of stanza a [`Notification`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`
    Iq,
}

/// A classified inbound stanza, handed to the owning client.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Which top-level stanza this is.
    pub kind: StanzaKind,
    /// The `type` attribute, if any (`chat`, `get`, `set`, `result`, `error`, ...).
    pub type_attr: Option<String>,
    /// The `from` attribute, canonicalized to lowercase; `None` if absent or empty.
    pub from: Option<String>,
    /// The `id` attribute, or the empty string if absent.
    pub id: String,
    /// For `<iq/>`, the namespace of the first child element (the query), if any.
    pub queryns: Option<String>,
    /// The raw, unmodified element.
    pub raw: Element,
}

/// What the dispatcher decided to do with one top-level stream element.
pub enum Dispatched {
    /// Deliver this to the owner.
    Notify(Notification),
    /// The element was a `<stream:error>` or application-level `<error/>`
    /// at the top level; the FSM must transition to `StreamError` with this
    /// condition.
    StreamError(String),
    /// An element the dispatcher doesn't classify further (spec §4.4: only
    /// forwarded raw while in `StreamOpened`/`LoggedIn`); callers decide
    /// whether to surface it.
    Raw(Element),
}

/// Everything the FSM can push to the owner's notification channel: a
/// classified stanza, an unrecognized top-level element forwarded verbatim,
/// or word that the stream has gone away.
#[derive(Debug, Clone)]
pub enum OwnerEvent {
    Stanza(Notification),
    Raw(Element),
    StreamClosed(Option<String>),
}

fn normalize_from(raw: Option<&str>) -> Option<String> {
    match raw {
        None => None,
        Some(s) if s.trim().is_empty() => None,
        Some(s) => Some(s.to_lowercase()),
    }
}

fn first_child_ns(el: &Element) -> Option<String> {
    el.children().next().map(|c| c.ns().to_string())
}

/// Extract the `defined-condition` child name of a `<stream:error/>` or
/// legacy `<error/>` element, per spec §4.4. Falls back to `"undefined-condition"`
/// when no recognizable condition child is present.
fn error_condition(el: &Element) -> String {
    el.children()
        .find(|c| c.ns() != NS_STREAMS || c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

/// Classify one top-level stream element.
pub fn classify(el: Element) -> Dispatched {
    let name = el.name();
    let ns = el.ns();

    if name == "error" && ns == NS_STREAMS {
        return Dispatched::StreamError(error_condition(&el));
    }

    match name {
        "message" => Dispatched::Notify(Notification {
            kind: StanzaKind::Message,
            type_attr: el.attr("type").map(|s| s.to_string()),
            from: normalize_from(el.attr("from")),
            id: el.attr("id").unwrap_or("").to_string(),
            queryns: None,
            raw: el,
        }),
        "presence" => Dispatched::Notify(Notification {
            kind: StanzaKind::Presence,
            type_attr: el.attr("type").map(|s| s.to_string()),
            from: normalize_from(el.attr("from")),
            id: el.attr("id").unwrap_or("").to_string(),
            queryns: None,
            raw: el,
        }),
        "iq" => {
            let queryns = first_child_ns(&el);
            Dispatched::Notify(Notification {
                kind: StanzaKind::Iq,
                type_attr: el.attr("type").map(|s| s.to_string()),
                from: normalize_from(el.attr("from")),
                id: el.attr("id").unwrap_or("").to_string(),
                queryns,
                raw: el,
            })
        }
        "error" => Dispatched::StreamError(error_condition(&el)),
        _ => Dispatched::Raw(el),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn classifies_message_and_lowercases_from() {
        let el = parse("<message xmlns='jabber:client' from='Alice@Example.ORG/Phone' id='m1' type='chat'><body>hi</body></message>");
        match classify(el) {
            Dispatched::Notify(n) => {
                assert_eq!(n.kind, StanzaKind::Message);
                assert_eq!(n.from.as_deref(), Some("alice@example.org/phone"));
                assert_eq!(n.id, "m1");
                assert_eq!(n.type_attr.as_deref(), Some("chat"));
            }
            _ => panic!("expected a notification"),
        }
    }

    #[test]
    fn empty_from_normalizes_to_none() {
        let el = parse("<presence xmlns='jabber:client' from=''/>");
        match classify(el) {
            Dispatched::Notify(n) => assert_eq!(n.from, None),
            _ => panic!("expected a notification"),
        }
    }

    #[test]
    fn missing_id_defaults_to_empty_string() {
        let el = parse("<presence xmlns='jabber:client'/>");
        match classify(el) {
            Dispatched::Notify(n) => assert_eq!(n.id, ""),
            _ => panic!("expected a notification"),
        }
    }

    #[test]
    fn iq_queryns_is_first_child_namespace() {
        let el = parse(
            "<iq xmlns='jabber:client' type='get' id='q1'><ping xmlns='urn:xmpp:ping'/></iq>",
        );
        match classify(el) {
            Dispatched::Notify(n) => {
                assert_eq!(n.kind, StanzaKind::Iq);
                assert_eq!(n.queryns.as_deref(), Some("urn:xmpp:ping"));
            }
            _ => panic!("expected a notification"),
        }
    }

    #[test]
    fn stream_error_is_classified_separately() {
        let el = parse(
            "<error xmlns='http://etherx.jabber.org/streams'><policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></error>",
        );
        match classify(el) {
            Dispatched::StreamError(cond) => assert_eq!(cond, "policy-violation"),
            _ => panic!("expected a stream error"),
        }
    }

    #[test]
    fn unknown_top_level_element_is_forwarded_raw() {
        let el = parse("<foo xmlns='jabber:client'/>");
        match classify(el) {
            Dispatched::Raw(e) => assert_eq!(e.name(), "foo"),
            _ => panic!("expected a raw element"),
        }
    }
}

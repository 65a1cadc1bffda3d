//! Typed stanzas: IQ, Presence and Message.
//!
//! A stanza wraps its [`Element`] together with the parsed `from` and `to`
//! addresses. Constructors write both addresses back into the element so the
//! wire form always matches the routing data.

use super::errors::StanzaErrorCondition;
use super::{ns, Element};
use crate::jid::Jid;

fn with_addresses(mut elem: Element, from: &Jid, to: &Jid) -> Element {
    elem.set_attr("from", from.to_string());
    elem.set_attr("to", to.to_string());
    elem
}

/// Error reply for `elem`: addresses swapped, `type="error"` and an
/// `<error/>` child carrying `condition`.
pub fn make_error_element(
    elem: &Element,
    condition: StanzaErrorCondition,
    app_conditions: Vec<Element>,
) -> Element {
    let mut reply = elem.clone();
    let from = elem.get_attr("from").map(str::to_string);
    let to = elem.get_attr("to").map(str::to_string);
    reply.remove_attr("from");
    reply.remove_attr("to");
    if let Some(to) = to {
        reply.set_attr("from", to);
    }
    if let Some(from) = from {
        reply.set_attr("to", from);
    }
    reply.set_attr("type", "error");
    reply.append(condition.element(app_conditions));
    reply
}

macro_rules! stanza_common {
    ($ty:ident) => {
        impl $ty {
            pub fn element(&self) -> &Element {
                &self.elem
            }

            pub fn into_element(self) -> Element {
                self.elem
            }

            pub fn from(&self) -> &Jid {
                &self.from
            }

            pub fn to(&self) -> &Jid {
                &self.to
            }

            pub fn id(&self) -> &str {
                self.elem.id()
            }

            pub fn type_attr(&self) -> &str {
                self.elem.type_attr()
            }

            pub fn make_error(&self, condition: StanzaErrorCondition) -> Element {
                make_error_element(&self.elem, condition, Vec::new())
            }

            pub fn make_error_with(
                &self,
                condition: StanzaErrorCondition,
                app_conditions: Vec<Element>,
            ) -> Element {
                make_error_element(&self.elem, condition, app_conditions)
            }

            /// Same stanza re-addressed.
            pub fn with_addresses(&self, from: &Jid, to: &Jid) -> $ty {
                $ty {
                    elem: with_addresses(self.elem.clone(), from, to),
                    from: from.clone(),
                    to: to.clone(),
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    elem: Element,
    from: Jid,
    to: Jid,
}

stanza_common!(Iq);

impl Iq {
    /// Validates an `<iq/>` element (RFC 6120 §8.2.3).
    pub fn from_element(elem: Element, from: &Jid, to: &Jid) -> Result<Self, StanzaErrorCondition> {
        if elem.name() != "iq" {
            return Err(StanzaErrorCondition::BadRequest);
        }
        if elem.id().is_empty() {
            return Err(StanzaErrorCondition::BadRequest);
        }
        let children = elem.elements().len();
        match elem.type_attr() {
            "get" | "set" if children == 1 => {}
            "result" if children <= 1 => {}
            "error" => {}
            _ => return Err(StanzaErrorCondition::BadRequest),
        }
        Ok(Self::new(elem, from, to))
    }

    /// Wraps without validation. Used for server-built IQs.
    pub fn new(elem: Element, from: &Jid, to: &Jid) -> Self {
        Self {
            elem: with_addresses(elem, from, to),
            from: from.clone(),
            to: to.clone(),
        }
    }

    pub fn is_get(&self) -> bool {
        self.type_attr() == "get"
    }

    pub fn is_set(&self) -> bool {
        self.type_attr() == "set"
    }

    pub fn is_result(&self) -> bool {
        self.type_attr() == "result"
    }

    pub fn is_error(&self) -> bool {
        self.type_attr() == "error"
    }

    /// The single child of a get/set request.
    pub fn payload(&self) -> Option<&Element> {
        self.elem.elements().first()
    }

    /// Empty `type="result"` reply.
    pub fn result_iq(&self) -> Element {
        Element::new("iq")
            .attr("id", self.id())
            .attr("type", "result")
            .attr("from", self.to.to_string())
            .attr("to", self.from.to_string())
    }

    /// Result reply carrying `payload`.
    pub fn result_with(&self, payload: Element) -> Element {
        self.result_iq().child(payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    elem: Element,
    from: Jid,
    to: Jid,
}

stanza_common!(Presence);

/// `<c/>` element announced with a presence (XEP-0115).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsAnnouncement {
    pub node: String,
    pub ver: String,
    pub hash: String,
}

impl Presence {
    pub fn from_element(elem: Element, from: &Jid, to: &Jid) -> Result<Self, StanzaErrorCondition> {
        if elem.name() != "presence" {
            return Err(StanzaErrorCondition::BadRequest);
        }
        match elem.type_attr() {
            "" | "available" | "unavailable" | "subscribe" | "subscribed" | "unsubscribe"
            | "unsubscribed" | "probe" | "error" => {}
            _ => return Err(StanzaErrorCondition::BadRequest),
        }
        if let Some(show) = elem.find("show") {
            if !matches!(show.get_text(), "away" | "chat" | "dnd" | "xa") {
                return Err(StanzaErrorCondition::BadRequest);
            }
        }
        if let Some(priority) = elem.find("priority") {
            if priority.get_text().trim().parse::<i8>().is_err() {
                return Err(StanzaErrorCondition::BadRequest);
            }
        }
        Ok(Self::new(elem, from, to))
    }

    pub fn new(elem: Element, from: &Jid, to: &Jid) -> Self {
        Self {
            elem: with_addresses(elem, from, to),
            from: from.clone(),
            to: to.clone(),
        }
    }

    /// Bare `<presence type="..."/>` between two addresses.
    pub fn with_type(from: &Jid, to: &Jid, presence_type: &str) -> Self {
        Self::new(
            Element::new("presence").attr_opt("type", presence_type),
            from,
            to,
        )
    }

    pub fn is_available(&self) -> bool {
        matches!(self.type_attr(), "" | "available")
    }

    pub fn is_unavailable(&self) -> bool {
        self.type_attr() == "unavailable"
    }

    pub fn is_subscription(&self) -> bool {
        matches!(
            self.type_attr(),
            "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed"
        )
    }

    pub fn priority(&self) -> i8 {
        self.elem
            .find("priority")
            .and_then(|p| p.get_text().trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn show(&self) -> &str {
        self.elem.find("show").map(|s| s.get_text()).unwrap_or("")
    }

    pub fn status(&self) -> &str {
        self.elem.find("status").map(|s| s.get_text()).unwrap_or("")
    }

    pub fn caps(&self) -> Option<CapsAnnouncement> {
        let c = self.elem.find_ns("c", ns::CAPS)?;
        let node = c.attr_str("node");
        let ver = c.attr_str("ver");
        if node.is_empty() || ver.is_empty() {
            return None;
        }
        Some(CapsAnnouncement {
            node: node.to_string(),
            ver: ver.to_string(),
            hash: c.attr_str("hash").to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    elem: Element,
    from: Jid,
    to: Jid,
}

stanza_common!(Message);

impl Message {
    pub fn from_element(elem: Element, from: &Jid, to: &Jid) -> Result<Self, StanzaErrorCondition> {
        if elem.name() != "message" {
            return Err(StanzaErrorCondition::BadRequest);
        }
        match elem.type_attr() {
            "" | "normal" | "chat" | "groupchat" | "headline" | "error" => {}
            _ => return Err(StanzaErrorCondition::BadRequest),
        }
        Ok(Self::new(elem, from, to))
    }

    pub fn new(elem: Element, from: &Jid, to: &Jid) -> Self {
        Self {
            elem: with_addresses(elem, from, to),
            from: from.clone(),
            to: to.clone(),
        }
    }

    pub fn is_chat(&self) -> bool {
        self.type_attr() == "chat"
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.type_attr(), "" | "normal")
    }

    pub fn body(&self) -> Option<&str> {
        self.elem.find("body").map(|b| b.get_text())
    }

    /// Chat or normal message carrying a body.
    pub fn is_message_with_body(&self) -> bool {
        (self.is_chat() || self.is_normal()) && self.body().is_some()
    }
}

/// Any of the three stanza kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Iq(Iq),
    Presence(Presence),
    Message(Message),
}

impl Stanza {
    /// Builds and validates a stanza from a top-level element. An unknown
    /// element name yields `None`.
    pub fn from_element(
        elem: Element,
        from: &Jid,
        to: &Jid,
    ) -> Option<Result<Stanza, StanzaErrorCondition>> {
        match elem.name() {
            "iq" => Some(Iq::from_element(elem, from, to).map(Stanza::Iq)),
            "presence" => Some(Presence::from_element(elem, from, to).map(Stanza::Presence)),
            "message" => Some(Message::from_element(elem, from, to).map(Stanza::Message)),
            _ => None,
        }
    }

    pub fn element(&self) -> &Element {
        match self {
            Stanza::Iq(s) => s.element(),
            Stanza::Presence(s) => s.element(),
            Stanza::Message(s) => s.element(),
        }
    }

    pub fn into_element(self) -> Element {
        match self {
            Stanza::Iq(s) => s.into_element(),
            Stanza::Presence(s) => s.into_element(),
            Stanza::Message(s) => s.into_element(),
        }
    }

    pub fn from(&self) -> &Jid {
        match self {
            Stanza::Iq(s) => s.from(),
            Stanza::Presence(s) => s.from(),
            Stanza::Message(s) => s.from(),
        }
    }

    pub fn to(&self) -> &Jid {
        match self {
            Stanza::Iq(s) => s.to(),
            Stanza::Presence(s) => s.to(),
            Stanza::Message(s) => s.to(),
        }
    }

    pub fn make_error(&self, condition: StanzaErrorCondition) -> Element {
        make_error_element(self.element(), condition, Vec::new())
    }

    pub fn make_error_with(
        &self,
        condition: StanzaErrorCondition,
        app_conditions: Vec<Element>,
    ) -> Element {
        make_error_element(self.element(), condition, app_conditions)
    }

    pub fn with_addresses(&self, from: &Jid, to: &Jid) -> Stanza {
        match self {
            Stanza::Iq(s) => Stanza::Iq(s.with_addresses(from, to)),
            Stanza::Presence(s) => Stanza::Presence(s.with_addresses(from, to)),
            Stanza::Message(s) => Stanza::Message(s.with_addresses(from, to)),
        }
    }

    /// Error stanzas are never answered with another error.
    pub fn is_error(&self) -> bool {
        self.element().type_attr() == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_iq_validation() {
        let from = jid("ortuman@jackal.im/balcony");
        let to = jid("jackal.im");
        let ok = Element::new("iq")
            .attr("id", "1")
            .attr("type", "get")
            .child(Element::with_ns("ping", ns::PING));
        assert!(Iq::from_element(ok, &from, &to).is_ok());

        let no_id = Element::new("iq").attr("type", "get").child(Element::new("x"));
        assert_eq!(
            Iq::from_element(no_id, &from, &to),
            Err(StanzaErrorCondition::BadRequest)
        );
        let no_child = Element::new("iq").attr("id", "1").attr("type", "set");
        assert!(Iq::from_element(no_child, &from, &to).is_err());
        let bad_type = Element::new("iq").attr("id", "1").attr("type", "foo");
        assert!(Iq::from_element(bad_type, &from, &to).is_err());
    }

    #[test]
    fn test_iq_result_swaps_addresses() {
        let iq = Iq::new(
            Element::new("iq").attr("id", "r1").attr("type", "set"),
            &jid("ortuman@jackal.im/balcony"),
            &jid("ortuman@jackal.im"),
        );
        let result = iq.result_iq();
        assert_eq!(result.attr_str("from"), "ortuman@jackal.im");
        assert_eq!(result.attr_str("to"), "ortuman@jackal.im/balcony");
        assert_eq!(result.type_attr(), "result");
        assert_eq!(result.id(), "r1");
    }

    #[test]
    fn test_make_error() {
        let msg = Message::new(
            Element::new("message").attr("id", "m1").child(Element::new("body").text("hi")),
            &jid("hamlet@jackal.im/balcony"),
            &jid("ortuman@jackal.im/balcony"),
        );
        let err = msg.make_error(StanzaErrorCondition::ServiceUnavailable);
        assert_eq!(err.name(), "message");
        assert_eq!(err.type_attr(), "error");
        assert_eq!(err.attr_str("from"), "ortuman@jackal.im/balcony");
        assert_eq!(err.attr_str("to"), "hamlet@jackal.im/balcony");
        let error = err.find("error").unwrap();
        assert!(error.find_ns("service-unavailable", ns::STANZAS).is_some());
    }

    #[test]
    fn test_presence_accessors() {
        let elem = Element::new("presence")
            .child(Element::new("priority").text("5"))
            .child(Element::new("show").text("away"))
            .child(Element::new("status").text("out"))
            .child(
                Element::with_ns("c", ns::CAPS)
                    .attr("node", "http://code.google.com/p/exodus")
                    .attr("ver", "QgayPKawpkPSDYmwT/WM94uAlu0=")
                    .attr("hash", "sha-1"),
            );
        let p = Presence::from_element(elem, &jid("a@jackal.im/r"), &jid("a@jackal.im")).unwrap();
        assert!(p.is_available());
        assert_eq!(p.priority(), 5);
        assert_eq!(p.show(), "away");
        assert_eq!(p.status(), "out");
        assert_eq!(p.caps().unwrap().ver, "QgayPKawpkPSDYmwT/WM94uAlu0=");
    }

    #[test]
    fn test_presence_invalid_show() {
        let elem = Element::new("presence").child(Element::new("show").text("sleeping"));
        assert!(Presence::from_element(elem, &jid("a@b"), &jid("a@b")).is_err());
    }

    #[test]
    fn test_stanza_dispatch() {
        let from = jid("a@jackal.im/r");
        let to = jid("b@jackal.im");
        let s = Stanza::from_element(Element::new("message").attr("type", "chat"), &from, &to);
        assert!(matches!(s, Some(Ok(Stanza::Message(_)))));
        assert!(Stanza::from_element(Element::new("foo"), &from, &to).is_none());
    }
}

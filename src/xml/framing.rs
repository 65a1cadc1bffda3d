//! Stream root framing for both transports.
//!
//! TCP streams are wrapped in `<stream:stream>` / `</stream:stream>`. RFC 7395
//! WebSocket streams use standalone `<open/>` and `<close/>` frames, and since
//! every frame is an independent XML document the `stream:` prefix cannot be
//! resolved there: `<stream:features>` and `<stream:error>` are rewritten to
//! their unprefixed form with an explicit streams namespace.

use std::borrow::Cow;

use super::{ns, Element};

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Server opening tag for a TCP stream.
pub fn stream_open_tag(from: &str, id: &str) -> String {
    let root = Element::new("stream:stream")
        .attr("xmlns", ns::CLIENT)
        .attr("xmlns:stream", ns::STREAMS)
        .attr_opt("from", from)
        .attr_opt("id", id)
        .attr("version", "1.0");
    format!("<?xml version='1.0'?>{}", root.to_open_tag())
}

/// Server `<open/>` frame for a WebSocket stream.
pub fn framed_open(from: &str, id: &str) -> Element {
    Element::with_ns("open", ns::FRAMING)
        .attr_opt("from", from)
        .attr_opt("id", id)
        .attr("version", "1.0")
}

pub fn framed_close() -> Element {
    Element::with_ns("close", ns::FRAMING)
}

pub fn is_framed_close(elem: &Element) -> bool {
    elem.name() == "close" && elem.namespace() == ns::FRAMING
}

/// Rewrites `stream:`-prefixed elements for standalone WebSocket frames.
/// Anything else passes through borrowed.
pub fn to_framed(elem: &Element) -> Cow<'_, Element> {
    let Some(local) = elem.name().strip_prefix("stream:") else {
        return Cow::Borrowed(elem);
    };
    if local == "stream" {
        return Cow::Borrowed(elem);
    }
    let mut rewritten = elem.clone();
    rewritten.set_name(local);
    if rewritten.get_attr("xmlns").is_none() {
        rewritten.set_attr("xmlns", ns::STREAMS);
    }
    Cow::Owned(rewritten)
}

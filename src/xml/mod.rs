//! XML element model, incremental parser, stream framing and stanzas.

mod element;
pub mod errors;
pub mod framing;
pub mod ns;
pub mod parser;
pub mod stanza;

pub use element::Element;
pub use errors::{StanzaErrorCondition, StreamErrorKind};
pub use parser::{ParseError, ParseEvent, Parser};
pub use stanza::{Iq, Message, Presence, Stanza};

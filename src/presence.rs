//! Presence, typing and contact-list documents carried in SIP bodies.

use crate::{SipError, SipParseError, SipResult};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt::Display;
use std::io::Cursor;

pub const CONTENT_TYPE_PIDF: &str = "application/pidf+xml";
pub const CONTENT_TYPE_XPIDF: &str = "application/xpidf+xml";
pub const CONTENT_TYPE_ISCOMPOSING: &str = "application/im-iscomposing+xml";
pub const CONTENT_TYPE_ROAMING_CONTACTS: &str = "application/vnd-microsoft-roaming-contacts+xml";

const PIDF_NS: &str = "urn:ietf:params:xml:ns:pidf";
const ISCOMPOSING_NS: &str = "urn:ietf:params:xml:ns:im-iscomposing";
const TUPLE_ID: &str = "bs35r9f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInfo {
    pub basic: BasicStatus,
    pub note: Option<String>,
}

impl PresenceInfo {
    /// Status text reported to the account layer.
    pub fn status_text(&self) -> &'static str {
        match self.basic {
            BasicStatus::Open => "available",
            BasicStatus::Closed => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoamingContact {
    pub uri: String,
    pub name: Option<String>,
    pub groups: Vec<String>,
}

fn xml_error(context: &str, err: impl Display) -> SipError {
    SipError::MalformedMessage(SipParseError::ParseError(format!("{}: {}", context, err)))
}

struct XmlWriter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlWriter {
    fn new() -> SipResult<Self> {
        let mut xml = Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        };
        xml.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(xml)
    }

    fn event(&mut self, event: Event<'_>) -> SipResult<()> {
        self.writer
            .write_event(event)
            .map_err(|e| xml_error("XML generation failed", e))
    }

    fn start(&mut self, element: BytesStart<'_>) -> SipResult<()> {
        self.event(Event::Start(element))
    }

    fn end(&mut self, name: &str) -> SipResult<()> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn empty(&mut self, element: BytesStart<'_>) -> SipResult<()> {
        self.event(Event::Empty(element))
    }

    fn text_element(&mut self, name: &str, text: &str) -> SipResult<()> {
        self.start(BytesStart::new(name))?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn finish(self) -> SipResult<String> {
        String::from_utf8(self.writer.into_inner().into_inner())
            .map_err(|e| xml_error("XML generation failed", e))
    }
}

/// PIDF document announcing us as open with `note` as the status text.
pub fn pidf_document(entity: &str, note: &str) -> SipResult<String> {
    let mut xml = XmlWriter::new()?;

    let mut presence = BytesStart::new("presence");
    presence.push_attribute(("xmlns", PIDF_NS));
    presence.push_attribute(("xmlns:im", "urn:ietf:params:xml:ns:pidf:im"));
    presence.push_attribute(("xmlns:cp", "urn:ietf:params:xml:ns:pidf:cipid"));
    presence.push_attribute(("xmlns:ep", "urn:ietf:params:xml:ns:pidf:status:rpid"));
    presence.push_attribute(("entity", entity));
    xml.start(presence)?;

    let mut tuple = BytesStart::new("tuple");
    tuple.push_attribute(("id", TUPLE_ID));
    xml.start(tuple)?;
    xml.start(BytesStart::new("status"))?;
    xml.text_element("basic", "open")?;
    xml.end("status")?;
    xml.text_element("note", note)?;
    xml.end("tuple")?;

    xml.end("presence")?;
    xml.finish()
}

/// Legacy XPIDF document for watchers that cannot read PIDF.
pub fn xpidf_document(entity: &str, status: &str) -> SipResult<String> {
    let mut xml = XmlWriter::new()?;
    xml.start(BytesStart::new("presence"))?;

    let mut presentity = BytesStart::new("presentity");
    presentity.push_attribute(("uri", format!("{};method=SUBSCRIBE", entity).as_str()));
    xml.empty(presentity)?;

    let mut display = BytesStart::new("display");
    display.push_attribute(("name", entity));
    xml.empty(display)?;

    let mut atom = BytesStart::new("atom");
    atom.push_attribute(("id", "1234"));
    xml.start(atom)?;
    let mut address = BytesStart::new("address");
    address.push_attribute(("uri", entity));
    xml.start(address)?;
    let mut status_element = BytesStart::new("status");
    status_element.push_attribute(("status", status));
    xml.empty(status_element)?;
    xml.end("address")?;
    xml.end("atom")?;

    xml.end("presence")?;
    xml.finish()
}

/// Typing indicator body for a MESSAGE.
pub fn is_composing_document(active: bool) -> SipResult<String> {
    let mut xml = XmlWriter::new()?;

    let mut root = BytesStart::new("isComposing");
    root.push_attribute(("xmlns", ISCOMPOSING_NS));
    root.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
    root.push_attribute((
        "xsi:schemaLocation",
        "urn:ietf:params:xml:ns:im-composing iscomposing.xsd",
    ));
    xml.start(root)?;
    xml.text_element("state", if active { "active" } else { "idle" })?;
    xml.text_element("contenttype", "text/plain")?;
    xml.text_element("refresh", "60")?;
    xml.end("isComposing")?;

    xml.finish()
}

fn reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader
}

/// Text content of every element whose local name is `name`, in order.
fn element_texts(xml: &str, name: &[u8]) -> SipResult<Vec<String>> {
    let mut reader = reader(xml);
    let mut texts = Vec::new();
    let mut inside = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == name => inside = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == name => inside = false,
            Ok(Event::Text(e)) if inside => {
                let text = e.unescape().map_err(|err| xml_error("Bad XML text", err))?;
                texts.push(text.into_owned());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error("Bad XML document", e)),
        }
    }

    Ok(texts)
}

/// Reads `tuple/status/basic` and the optional `note` from a PIDF body.
/// Namespace prefixes are ignored.
pub fn parse_pidf(xml: &str) -> SipResult<PresenceInfo> {
    let basic = element_texts(xml, b"basic")?
        .into_iter()
        .next()
        .ok_or_else(|| xml_error("Bad PIDF document", "no basic status"))?;

    Ok(PresenceInfo {
        basic: if basic.trim().eq_ignore_ascii_case("open") {
            BasicStatus::Open
        } else {
            BasicStatus::Closed
        },
        note: element_texts(xml, b"note")?.into_iter().next(),
    })
}

/// True when the peer reports itself as typing.
pub fn parse_is_composing(xml: &str) -> SipResult<bool> {
    let state = element_texts(xml, b"state")?
        .into_iter()
        .next()
        .ok_or_else(|| xml_error("Bad isComposing document", "no state"))?;
    Ok(state.contains("active"))
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> SipResult<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| xml_error("Bad XML attribute", e))?;
        if attr.key.local_name().as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| xml_error("Bad XML attribute", e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parses a roaming contact list. Group ids on each contact are resolved
/// to group names where the list declares them.
pub fn parse_roaming_contacts(xml: &str) -> SipResult<Vec<RoamingContact>> {
    let mut reader = reader(xml);
    let mut groups: Vec<(String, String)> = Vec::new();
    let mut raw_contacts: Vec<(String, Option<String>, Vec<String>)> = Vec::new();

    loop {
        let element = match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => e,
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => return Err(xml_error("Bad contact list", e)),
        };

        match element.local_name().as_ref() {
            b"group" => {
                if let (Some(id), Some(name)) =
                    (attribute(&element, b"id")?, attribute(&element, b"name")?)
                {
                    groups.push((id, name));
                }
            }
            b"contact" => {
                let Some(uri) = attribute(&element, b"uri")? else {
                    continue;
                };
                let name = attribute(&element, b"name")?.filter(|name| !name.is_empty());
                let ids = attribute(&element, b"groups")?
                    .map(|ids| ids.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                raw_contacts.push((uri, name, ids));
            }
            _ => {}
        }
    }

    Ok(raw_contacts
        .into_iter()
        .map(|(uri, name, ids)| RoamingContact {
            uri,
            name,
            groups: ids
                .into_iter()
                .map(|id| {
                    groups
                        .iter()
                        .find(|(group_id, _)| *group_id == id)
                        .map(|(_, name)| name.clone())
                        .unwrap_or(id)
                })
                .collect(),
        })
        .collect())
}

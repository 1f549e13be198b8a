//! Streaming entry reader for report documents.
//!
//! The report is pulled event by event with `quick-xml`; only the subtree
//! of the entry currently being read is held in memory. Two layouts are
//! recognized:
//!
//! - **Element layout**: a section element (`<messages>`, `<contacts>`,
//!   `<calls>`, ...) whose children are entries with one child element
//!   per field.
//! - **Model layout**: Cellebrite `<model type="...">` elements holding
//!   `<field name="..."><value>...</value></field>` children. A `Chat`
//!   model is not an entry itself; it groups the message models nested in
//!   it, and its `id` becomes their thread hint.
//!
//! Each captured entry is handed to a callback as a [`RawEntry`].

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;

use crate::error::{ContainerError, PipelineError};
use crate::models::RecordKind;

const MESSAGE_SECTIONS: &[&str] = &["messages", "msgs", "sms", "chats"];
const MESSAGE_ENTRIES: &[&str] = &["message", "msg", "sms", "chat"];
const CONTACT_SECTIONS: &[&str] = &["contacts"];
const CONTACT_ENTRIES: &[&str] = &["contact"];
const CALL_SECTIONS: &[&str] = &["calls", "calllog", "call_log"];
const CALL_ENTRIES: &[&str] = &["call"];

/// An element subtree with lower-cased local names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Element,
    Model,
}

/// One entry captured from the report, not yet mapped onto a record.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub kind: RecordKind,
    pub layout: Layout,
    /// Position of this entry among entries of the same kind.
    pub ordinal: usize,
    /// Element path plus ordinal, e.g. `report/messages/message[0]`.
    pub locator: String,
    /// Id of the enclosing `Chat` model, if any.
    pub thread: Option<String>,
    pub node: Node,
}

struct Capture {
    kind: RecordKind,
    layout: Layout,
    locator: String,
    ordinal: usize,
    thread: Option<String>,
    open: Vec<Node>,
}

/// Streams `path`, calling `on_entry` for every entry in document order.
///
/// Returns the number of entries read. XML syntax errors are fatal; an error
/// returned by the callback stops the walk and is passed through.
pub fn read_entries<F>(path: &Path, mut on_entry: F) -> Result<usize, PipelineError>
where
    F: FnMut(RawEntry) -> Result<(), PipelineError>,
{
    let mut reader = Reader::from_file(path).map_err(|e| syntax(path, 0, e))?;
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    // (stack depth of the chat element, chat id)
    let mut threads: Vec<(usize, Option<String>)> = Vec::new();
    let mut capture: Option<Capture> = None;
    let mut ordinals = [0usize; 3];
    let mut total = 0usize;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| syntax(path, position, e))?;

        let mut closed: Option<Node> = None;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let node = open_node(e).map_err(|msg| syntax(path, position, msg))?;
                if let Some(cap) = capture.as_mut() {
                    cap.open.push(node);
                } else if let Some((kind, layout)) =
                    entry_kind(stack.last().map(String::as_str), &node)
                {
                    let slot = kind_slot(kind);
                    let ordinal = ordinals[slot];
                    ordinals[slot] += 1;
                    let mut locator = stack.join("/");
                    if !locator.is_empty() {
                        locator.push('/');
                    }
                    locator.push_str(&format!("{}[{}]", node.name, ordinal));
                    capture = Some(Capture {
                        kind,
                        layout,
                        locator,
                        ordinal,
                        thread: threads.last().and_then(|(_, id)| id.clone()),
                        open: vec![node],
                    });
                } else if !is_empty {
                    if is_thread_container(&node) {
                        threads.push((stack.len() + 1, node.attr("id").map(str::to_string)));
                    }
                    stack.push(node.name);
                }
                if is_empty && capture.is_some() {
                    closed = capture.as_mut().and_then(|cap| close_node(&mut cap.open));
                }
            }
            Event::End(_) => match capture.as_mut() {
                Some(cap) => closed = close_node(&mut cap.open),
                None => {
                    if threads.last().is_some_and(|(depth, _)| *depth == stack.len()) {
                        threads.pop();
                    }
                    stack.pop();
                }
            },
            Event::Text(ref t) => {
                if let Some(node) = capture.as_mut().and_then(|cap| cap.open.last_mut()) {
                    let text = t.unescape().map_err(|e| syntax(path, position, e))?;
                    node.text.push_str(&text);
                }
            }
            Event::CData(ref c) => {
                if let Some(node) = capture.as_mut().and_then(|cap| cap.open.last_mut()) {
                    node.text.push_str(&String::from_utf8_lossy(c));
                }
            }
            Event::Eof => {
                if capture.is_some() {
                    return Err(syntax(path, position, "document ended inside an entry"));
                }
                break;
            }
            _ => {}
        }

        if let Some(node) = closed {
            if let Some(cap) = capture.take() {
                total += 1;
                on_entry(RawEntry {
                    kind: cap.kind,
                    layout: cap.layout,
                    ordinal: cap.ordinal,
                    locator: cap.locator,
                    thread: cap.thread,
                    node,
                })?;
            }
        }
        buf.clear();
    }

    Ok(total)
}

/// Pops the innermost open node. Returns the entry root once it closes.
fn close_node(open: &mut Vec<Node>) -> Option<Node> {
    let mut node = open.pop()?;
    node.text = node.text.trim().to_string();
    match open.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            None
        }
        None => Some(node),
    }
}

fn entry_kind(parent: Option<&str>, node: &Node) -> Option<(RecordKind, Layout)> {
    if node.name == "model" {
        let kind = match node.attr("type")?.to_ascii_lowercase().as_str() {
            "instantmessage" | "sms" | "mms" | "email" | "message" => RecordKind::Message,
            "contact" => RecordKind::Contact,
            "call" => RecordKind::Call,
            _ => return None,
        };
        return Some((kind, Layout::Model));
    }

    let parent = parent?;
    let name = node.name.as_str();
    let kind = if MESSAGE_SECTIONS.contains(&parent) && MESSAGE_ENTRIES.contains(&name) {
        RecordKind::Message
    } else if CONTACT_SECTIONS.contains(&parent) && CONTACT_ENTRIES.contains(&name) {
        RecordKind::Contact
    } else if CALL_SECTIONS.contains(&parent) && CALL_ENTRIES.contains(&name) {
        RecordKind::Call
    } else {
        return None;
    };
    Some((kind, Layout::Element))
}

fn is_thread_container(node: &Node) -> bool {
    node.name == "model"
        && node
            .attr("type")
            .is_some_and(|t| t.eq_ignore_ascii_case("chat"))
}

fn kind_slot(kind: RecordKind) -> usize {
    match kind {
        RecordKind::Message => 0,
        RecordKind::Contact => 1,
        RecordKind::Call => 2,
    }
}

fn open_node(e: &BytesStart<'_>) -> Result<Node, String> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_ascii_lowercase();
        let value = attr.unescape_value().map_err(|err| err.to_string())?;
        attrs.push((key, value.trim().to_string()));
    }
    Ok(Node {
        name,
        attrs,
        ..Node::default()
    })
}

fn syntax(path: &Path, position: u64, e: impl ToString) -> PipelineError {
    ContainerError::ReportSyntax {
        path: path.to_path_buf(),
        position,
        message: e.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn read_all(xml: &str) -> Result<Vec<RawEntry>, PipelineError> {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.xml");
        fs::write(&path, xml).unwrap();
        let mut out = Vec::new();
        read_entries(&path, |e| {
            out.push(e);
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn element_layout_sections() {
        let entries = read_all(
            r#"<report>
                 <messages>
                   <message id="m1"><body>hi &amp; bye</body><attachment>media/a.jpg</attachment></message>
                   <message><body><![CDATA[<raw>]]></body></message>
                 </messages>
                 <contacts><contact><name>Ann</name></contact></contacts>
                 <calls><call><duration>5</duration></call></calls>
               </report>"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].kind, RecordKind::Message);
        assert_eq!(entries[0].layout, Layout::Element);
        assert_eq!(entries[0].locator, "report/messages/message[0]");
        assert_eq!(entries[0].node.attr("id"), Some("m1"));
        assert_eq!(entries[0].node.children[0].text, "hi & bye");
        assert_eq!(entries[1].ordinal, 1);
        assert_eq!(entries[1].node.children[0].text, "<raw>");
        assert_eq!(entries[2].kind, RecordKind::Contact);
        assert_eq!(entries[2].ordinal, 0);
        assert_eq!(entries[3].kind, RecordKind::Call);
    }

    #[test]
    fn namespaces_and_case_are_ignored() {
        let entries = read_all(
            r#"<r:Report xmlns:r="urn:x"><r:Messages><r:Message><r:Body>x</r:Body></r:Message></r:Messages></r:Report>"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node.children[0].name, "body");
    }

    #[test]
    fn model_layout() {
        let entries = read_all(
            r#"<project><decodedData>
                 <modelType type="Call">
                   <model type="Call" id="c-1"><field name="Duration"><value>00:01:05</value></field></model>
                 </modelType>
                 <modelType type="Chat"><model type="Chat"><field name="Name"><value>group</value></field></model></modelType>
               </decodedData></project>"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, RecordKind::Call);
        assert_eq!(entries[0].layout, Layout::Model);
        assert_eq!(entries[0].node.attr("id"), Some("c-1"));
        assert_eq!(entries[0].thread, None);
    }

    #[test]
    fn chat_models_group_their_messages() {
        let entries = read_all(
            r#"<project><decodedData><modelType type="Chat">
                 <model type="Chat" id="chat-9">
                   <field name="Source"><value>WhatsApp</value></field>
                   <multiModelField name="Messages">
                     <model type="InstantMessage" id="im-1"><field name="Body"><value>first</value></field></model>
                     <model type="InstantMessage" id="im-2"><field name="Body"><value>second</value></field></model>
                   </multiModelField>
                 </model>
                 <model type="Chat">
                   <multiModelField name="Messages">
                     <model type="InstantMessage" id="im-3"/>
                   </multiModelField>
                 </model>
               </modelType>
               <modelType type="SMS"><model type="SMS" id="s-1"/></modelType>
               </decodedData></project>"#,
        )
        .unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.node.attr("id").unwrap()).collect();
        assert_eq!(ids, vec!["im-1", "im-2", "im-3", "s-1"]);
        assert!(entries.iter().all(|e| e.kind == RecordKind::Message));
        assert_eq!(entries[0].thread.as_deref(), Some("chat-9"));
        assert_eq!(entries[1].thread.as_deref(), Some("chat-9"));
        assert_eq!(entries[2].thread, None);
        assert_eq!(entries[3].thread, None);
        assert_eq!(
            entries[1].locator,
            "project/decodeddata/modeltype/model/multimodelfield/model[1]"
        );
    }

    #[test]
    fn self_closing_entry_is_captured() {
        let entries = read_all(r#"<report><contacts><contact name="Bob"/></contacts></report>"#)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node.attr("name"), Some("Bob"));
    }

    #[test]
    fn entries_outside_sections_are_ignored() {
        let entries =
            read_all(r#"<report><message><body>loose</body></message></report>"#).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn mismatched_tags_are_fatal() {
        let err = read_all(r#"<report><messages><message><body>x</message></messages></report>"#)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Container(ContainerError::ReportSyntax { .. })
        ));
    }

    #[test]
    fn callback_error_stops_the_walk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.xml");
        fs::write(
            &path,
            "<report><calls><call><a>1</a></call><call><a>2</a></call></calls></report>",
        )
        .unwrap();
        let mut seen = 0;
        let err = read_entries(&path, |_| {
            seen += 1;
            Err(PipelineError::Cancelled)
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(seen, 1);
    }
}

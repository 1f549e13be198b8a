//! Maps raw report entries onto normalized records.
//!
//! An entry is first flattened into an ordered [`FieldBag`] of
//! `key -> values` plus a list of attachment specs. Mapping then *takes*
//! known keys out of the bag by alias; whatever is left becomes the
//! record's unmapped-field bag, so no source field is ever dropped.
//! Attachment fields other than path, size and extension land there too,
//! under `attachment[<n>].<key>`.
//!
//! Timestamps and durations that cannot be parsed stay in the bag under
//! their source key and a warning is reported.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::diagnostics::{Diagnostics, Warning, WarningKind};
use crate::error::{ParseError, PipelineError};
use crate::ingest::CancelToken;
use crate::models::{
    BlobReference, Call, Contact, Direction, Message, Record, RecordKind, SourceRef,
    UnmappedFields,
};
use crate::report::{read_entries, Layout, Node, RawEntry};
use crate::timestamp::{parse_duration_secs, parse_timestamp};

const ID_KEYS: &[&str] = &["id", "@id", "uid"];

const MSG_ID: &[&str] = &["message_id", "msgid"];
const MSG_THREAD: &[&str] = &[
    "thread_id",
    "threadid",
    "thread",
    "chat_id",
    "chatid",
    "conversation_id",
    "conversation",
];
const MSG_SENDER: &[&str] = &["sender", "from", "from.identifier", "from.name", "author"];
const MSG_RECIPIENT: &[&str] = &[
    "recipient",
    "to",
    "to.identifier",
    "to.name",
    "parties.identifier",
];
const MSG_DIRECTION: &[&str] = &["direction", "folder"];
const MSG_PLATFORM: &[&str] = &[
    "platform",
    "sourceapplication",
    "source_application",
    "application",
    "app",
    "service",
];
const MSG_BODY: &[&str] = &["body", "text", "content", "snippet"];
const MSG_SENT: &[&str] = &[
    "timestamp",
    "time",
    "sent",
    "sent_at",
    "timestamp_utc",
    "datetime",
    "date",
];
const MSG_RECEIVED: &[&str] = &["received", "received_at", "delivered", "delivered_at"];
const MSG_STATUS: &[&str] = &["status", "state"];

const CONTACT_ID: &[&str] = &["contact_id"];
const CONTACT_NAME: &[&str] = &["name", "display_name", "displayname", "fullname", "full_name"];
const CONTACT_PHONES: &[&str] = &[
    "phone",
    "phones",
    "phone_number",
    "phonenumber",
    "phonenumbers",
    "number",
    "mobile",
    "phonenumber.value",
];
const CONTACT_EMAILS: &[&str] = &[
    "email",
    "emails",
    "email_address",
    "emailaddress",
    "emailaddress.value",
];

const CALL_ID: &[&str] = &["call_id"];
const CALL_CALLER: &[&str] = &["caller", "from", "from.identifier", "from.name"];
const CALL_CALLEE: &[&str] = &["callee", "to", "to.identifier", "to.name"];
const CALL_TYPE: &[&str] = &["call_type", "calltype", "type", "kind"];
const CALL_DIRECTION: &[&str] = &["direction"];
const CALL_DURATION: &[&str] = &["duration", "duration_secs", "length"];
const CALL_START: &[&str] = &[
    "timestamp",
    "start",
    "started_at",
    "start_time",
    "starttime",
    "time",
    "date",
];
const CALL_END: &[&str] = &["end", "ended_at", "end_time", "endtime"];

const ATTACHMENT_PATH_KEYS: &[&str] = &["localpath", "path", "src", "href", "file", "filename", "url"];
const ATTACHMENT_SIZE_KEYS: &[&str] = &["size", "length", "filesize"];
const ATTACHMENT_EXT_KEYS: &[&str] = &["extension", "ext"];

/// Text content of an `<attachment>` element; takes precedence as its path.
const TEXT_KEY: &str = "_text";

/// Attachment as declared in the report: every field it carried, before
/// path resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentSpec {
    fields: FieldBag,
}

/// Ordered multi-valued field bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldBag {
    fields: Vec<(String, Vec<String>)>,
}

impl FieldBag {
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.fields.push((key, vec![value])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn position(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| {
            self.fields
                .iter()
                .position(|(k, v)| k == alias && v.iter().any(|s| !s.trim().is_empty()))
        })
    }

    /// First non-empty value of the first present alias. Extra values stay behind.
    pub fn take_first(&mut self, aliases: &[&str]) -> Option<String> {
        let idx = self.position(aliases)?;
        let values = &mut self.fields[idx].1;
        let at = values.iter().position(|s| !s.trim().is_empty())?;
        let value = values.remove(at).trim().to_string();
        if values.iter().all(|s| s.trim().is_empty()) {
            self.fields.remove(idx);
        }
        Some(value)
    }

    /// All non-empty values of every present alias, in alias order, de-duplicated.
    pub fn take_all(&mut self, aliases: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for alias in aliases {
            if let Some(idx) = self.fields.iter().position(|(k, _)| k == alias) {
                let (_, values) = self.fields.remove(idx);
                for v in values {
                    let v = v.trim().to_string();
                    if !v.is_empty() && !out.contains(&v) {
                        out.push(v);
                    }
                }
            }
        }
        out
    }

    /// Like [`take_first`](Self::take_first) but only removes the value if `parse` accepts it.
    ///
    /// Returns the key and raw value when parsing failed, leaving both in the bag.
    fn take_parsed<T>(
        &mut self,
        aliases: &[&str],
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, (String, String)> {
        let Some(idx) = self.position(aliases) else {
            return Ok(None);
        };
        let key = self.fields[idx].0.clone();
        let raw = self.fields[idx]
            .1
            .iter()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_default();
        match parse(&raw) {
            Some(parsed) => {
                self.take_first(&[key.as_str()]);
                Ok(Some(parsed))
            }
            None => Err((key, raw)),
        }
    }

    /// Moves every field into `bag` as `prefix.key`.
    fn drain_into(self, bag: &mut FieldBag, prefix: &str) {
        for (key, values) in self.fields {
            let key = format!("{}.{}", prefix, key);
            for value in values {
                bag.push(key.clone(), value);
            }
        }
    }

    pub fn into_unmapped(self) -> UnmappedFields {
        let mut map = UnmappedFields::new();
        for (key, mut values) in self.fields {
            let value = if values.len() == 1 {
                Value::String(values.remove(0))
            } else {
                Value::Array(values.into_iter().map(Value::String).collect())
            };
            map.insert(key, value);
        }
        map
    }
}

/// Reads every entry of the report and maps it onto a record.
///
/// Malformed entries are skipped with a warning. The cancel token is checked
/// between entries.
pub fn extract_records(
    report_path: &Path,
    report_file: &str,
    case_id: &str,
    diagnostics: &dyn Diagnostics,
    cancel: &CancelToken,
) -> Result<Vec<Record>, PipelineError> {
    let extractor = Extractor {
        case_id,
        report_file,
        diagnostics,
    };
    let mut records = Vec::new();
    read_entries(report_path, |entry| {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let locator = entry.locator.clone();
        match extractor.to_record(entry) {
            Ok(record) => records.push(record),
            Err(e) => diagnostics.warn(Warning::new(
                WarningKind::SkippedEntry,
                format!("{}#{}", report_file, locator),
                e.to_string(),
            )),
        }
        Ok(())
    })?;
    Ok(records)
}

pub struct Extractor<'a> {
    pub case_id: &'a str,
    pub report_file: &'a str,
    pub diagnostics: &'a dyn Diagnostics,
}

impl Extractor<'_> {
    pub fn to_record(&self, entry: RawEntry) -> Result<Record, ParseError> {
        let node = &entry.node;
        if node.is_leaf() && node.attrs.is_empty() {
            return Err(if node.text.is_empty() {
                ParseError::EmptyEntry {
                    locator: entry.locator,
                }
            } else {
                ParseError::Unstructured {
                    locator: entry.locator,
                }
            });
        }

        let (mut bag, specs) = match entry.layout {
            Layout::Element => flatten_element(node),
            Layout::Model => flatten_model(node),
        };
        if bag.is_empty() && specs.is_empty() {
            return Err(ParseError::EmptyEntry {
                locator: entry.locator,
            });
        }

        let source = SourceRef {
            file: self.report_file.to_string(),
            locator: entry.locator.clone(),
        };
        let context = format!("{}#{}", self.report_file, entry.locator);
        let fallback_id = format!("{}-{:04}", entry.kind.id_prefix(), entry.ordinal + 1);
        let attachments = self.attachments(specs, &mut bag, &context);

        let record = match entry.kind {
            RecordKind::Message => {
                let id = bag
                    .take_first(ID_KEYS)
                    .or_else(|| bag.take_first(MSG_ID))
                    .unwrap_or(fallback_id);
                let thread_id = bag.take_first(MSG_THREAD).or_else(|| entry.thread.clone());
                let sender = bag.take_first(MSG_SENDER);
                let recipient = bag.take_first(MSG_RECIPIENT);
                let direction = bag
                    .take_first(MSG_DIRECTION)
                    .map(|d| Direction::from_raw(&d))
                    .unwrap_or(Direction::Unknown);
                let platform = bag.take_first(MSG_PLATFORM);
                let body = bag.take_first(MSG_BODY).unwrap_or_default();
                let body_sha256 = (!body.is_empty())
                    .then(|| format!("{:x}", Sha256::digest(body.as_bytes())));
                let sent_at = self.timestamp(&mut bag, MSG_SENT, &context);
                let received_at = self.timestamp(&mut bag, MSG_RECEIVED, &context);
                let status = bag.take_first(MSG_STATUS);
                Record::Message(Message {
                    id,
                    case_id: self.case_id.to_string(),
                    thread_id,
                    sender,
                    recipient,
                    direction,
                    platform,
                    body,
                    body_sha256,
                    sent_at,
                    received_at,
                    status,
                    attachments,
                    source,
                    unmapped: bag.into_unmapped(),
                })
            }
            RecordKind::Contact => {
                let id = bag
                    .take_first(ID_KEYS)
                    .or_else(|| bag.take_first(CONTACT_ID))
                    .unwrap_or(fallback_id);
                let name = bag.take_first(CONTACT_NAME);
                let phone_numbers = bag.take_all(CONTACT_PHONES);
                let emails = bag.take_all(CONTACT_EMAILS);
                Record::Contact(Contact {
                    id,
                    case_id: self.case_id.to_string(),
                    name,
                    phone_numbers,
                    emails,
                    attachments,
                    source,
                    unmapped: bag.into_unmapped(),
                })
            }
            RecordKind::Call => {
                let id = bag
                    .take_first(ID_KEYS)
                    .or_else(|| bag.take_first(CALL_ID))
                    .unwrap_or(fallback_id);
                let caller = bag.take_first(CALL_CALLER);
                let callee = bag.take_first(CALL_CALLEE);
                let call_type = bag.take_first(CALL_TYPE);
                let direction = bag
                    .take_first(CALL_DIRECTION)
                    .or_else(|| call_type.clone())
                    .map(|d| Direction::from_raw(&d))
                    .unwrap_or(Direction::Unknown);
                let duration_secs = match bag.take_parsed(CALL_DURATION, parse_duration_secs) {
                    Ok(d) => d,
                    Err((key, raw)) => {
                        self.diagnostics.warn(Warning::new(
                            WarningKind::UnparsedField,
                            context.clone(),
                            format!("duration `{}` in field `{}` kept raw", raw, key),
                        ));
                        None
                    }
                };
                let started_at = self.timestamp(&mut bag, CALL_START, &context);
                let ended_at = self.timestamp(&mut bag, CALL_END, &context);
                Record::Call(Call {
                    id,
                    case_id: self.case_id.to_string(),
                    caller,
                    callee,
                    call_type,
                    direction,
                    duration_secs,
                    started_at,
                    ended_at,
                    attachments,
                    source,
                    unmapped: bag.into_unmapped(),
                })
            }
        };
        Ok(record)
    }

    /// Turns declared attachments into references, in declaration order.
    ///
    /// Fields other than path, size and extension move into `bag` as
    /// `attachment[<n>].<key>`. A non-numeric size stays there raw. An
    /// attachment without a path produces no reference; its fields are kept
    /// the same way and a warning is reported.
    fn attachments(
        &self,
        specs: Vec<AttachmentSpec>,
        bag: &mut FieldBag,
        context: &str,
    ) -> Vec<BlobReference> {
        let mut references = Vec::new();
        for (index, spec) in specs.into_iter().enumerate() {
            let prefix = format!("attachment[{}]", index);
            let mut fields = spec.fields;
            let path = fields
                .take_first(&[TEXT_KEY])
                .or_else(|| fields.take_first(ATTACHMENT_PATH_KEYS));
            let Some(path) = path else {
                self.diagnostics.warn(Warning::new(
                    WarningKind::AttachmentWithoutPath,
                    context,
                    format!("{} has no path; its fields were kept as `{}.*`", prefix, prefix),
                ));
                fields.drain_into(bag, &prefix);
                continue;
            };

            let mut reference = BlobReference::new(normalize_rel_path(&path));
            reference.declared_size =
                match fields.take_parsed(ATTACHMENT_SIZE_KEYS, |s| s.trim().parse::<u64>().ok()) {
                    Ok(size) => size,
                    Err((key, raw)) => {
                        self.diagnostics.warn(Warning::new(
                            WarningKind::UnparsedField,
                            context,
                            format!("size `{}` in field `{}.{}` kept raw", raw, prefix, key),
                        ));
                        None
                    }
                };
            if let Some(ext) = fields.take_first(ATTACHMENT_EXT_KEYS) {
                let ext = ext.trim_start_matches('.').to_ascii_lowercase();
                if !ext.is_empty() {
                    reference.extension = Some(ext);
                }
            }
            fields.drain_into(bag, &prefix);
            references.push(reference);
        }
        references
    }

    fn timestamp(
        &self,
        bag: &mut FieldBag,
        aliases: &[&str],
        context: &str,
    ) -> Option<DateTime<Utc>> {
        match bag.take_parsed(aliases, parse_timestamp) {
            Ok(ts) => ts,
            Err((key, raw)) => {
                self.diagnostics.warn(Warning::new(
                    WarningKind::UnparsedTimestamp,
                    context,
                    format!("timestamp `{}` in field `{}` kept raw", raw, key),
                ));
                None
            }
        }
    }
}

/// Element layout: attributes and child elements are fields.
fn flatten_element(node: &Node) -> (FieldBag, Vec<AttachmentSpec>) {
    let mut bag = FieldBag::default();
    let mut attachments = Vec::new();

    for (k, v) in &node.attrs {
        bag.push(k.clone(), v.clone());
    }
    if !node.text.is_empty() && !node.is_leaf() {
        bag.push("_text", node.text.clone());
    }
    for child in &node.children {
        match child.name.as_str() {
            "attachment" => attachments.push(attachment_from_element(child)),
            "attachments" if child.is_leaf() => {
                attachments.push(attachment_from_element(child));
            }
            "attachments" => {
                for grandchild in &child.children {
                    attachments.push(attachment_from_element(grandchild));
                }
            }
            _ => flatten_into(&mut bag, child, &child.name),
        }
    }
    (bag, attachments)
}

/// Leaf elements become `prefix`; nested ones become `prefix.child`.
fn flatten_into(bag: &mut FieldBag, node: &Node, prefix: &str) {
    for (k, v) in &node.attrs {
        bag.push(format!("{}@{}", prefix, k), v.clone());
    }
    if node.is_leaf() {
        bag.push(prefix.to_string(), node.text.clone());
        return;
    }
    if !node.text.is_empty() {
        bag.push(prefix.to_string(), node.text.clone());
    }
    for child in &node.children {
        flatten_into(bag, child, &format!("{}.{}", prefix, child.name));
    }
}

fn attachment_from_element(node: &Node) -> AttachmentSpec {
    let mut fields = FieldBag::default();
    if !node.text.is_empty() {
        fields.push(TEXT_KEY, node.text.clone());
    }
    for (k, v) in &node.attrs {
        fields.push(k.clone(), v.clone());
    }
    for child in &node.children {
        flatten_into(&mut fields, child, &child.name);
    }
    AttachmentSpec { fields }
}

/// Model layout: `<field name>`/`<multiField>` values, nested models flattened.
///
/// A `modelField` (single nested model) is keyed by the field name
/// (`from.identifier`). In a `multiModelField` (list), `Party` models are
/// keyed by their `Role` value, or the field name when they have none
/// (`to.identifier`); other models by their type (`phonenumber.value`).
/// Nested `Attachment` models become attachments.
fn flatten_model(node: &Node) -> (FieldBag, Vec<AttachmentSpec>) {
    let mut bag = FieldBag::default();
    let mut attachments = Vec::new();
    for (k, v) in &node.attrs {
        bag.push(format!("@{}", k), v.clone());
    }
    collect_model_fields(node, "", &mut bag, &mut attachments);
    (bag, attachments)
}

fn collect_model_fields(
    node: &Node,
    prefix: &str,
    bag: &mut FieldBag,
    attachments: &mut Vec<AttachmentSpec>,
) {
    for child in &node.children {
        let name = child.attr("name").unwrap_or("").to_ascii_lowercase();
        match child.name.as_str() {
            "field" | "multifield" => {
                if name.is_empty() {
                    continue;
                }
                let key = format!("{}{}", prefix, name);
                let values: Vec<&Node> = child.children_named("value").collect();
                if values.is_empty() {
                    if !child.text.is_empty() {
                        bag.push(key, child.text.clone());
                    }
                } else {
                    for v in values {
                        if !v.text.is_empty() {
                            bag.push(key.clone(), v.text.clone());
                        }
                    }
                }
            }
            "modelfield" | "multimodelfield" => {
                let single = child.name == "modelfield";
                for model in child.children_named("model") {
                    let model_type = model.attr("type").unwrap_or("").to_ascii_lowercase();
                    if model_type == "attachment" {
                        let (spec, nested) = attachment_from_model(model);
                        attachments.push(spec);
                        attachments.extend(nested);
                        continue;
                    }
                    let key = match model_type.as_str() {
                        _ if single => name.clone(),
                        "" => name.clone(),
                        "party" => party_role(model).unwrap_or_else(|| name.clone()),
                        other => other.to_string(),
                    };
                    let nested = format!("{}{}.", prefix, key);
                    collect_model_fields(model, &nested, bag, attachments);
                }
            }
            other if prefix.is_empty() => {
                let key = other.to_string();
                flatten_into(bag, child, &key);
            }
            _ => {}
        }
    }
}

/// Returns the attachment plus any attachments nested inside it.
fn attachment_from_model(model: &Node) -> (AttachmentSpec, Vec<AttachmentSpec>) {
    let mut fields = FieldBag::default();
    for (k, v) in &model.attrs {
        fields.push(format!("@{}", k), v.clone());
    }
    let mut nested = Vec::new();
    collect_model_fields(model, "", &mut fields, &mut nested);
    (AttachmentSpec { fields }, nested)
}

/// Lower-cased `Role` field of a `Party` model.
fn party_role(model: &Node) -> Option<String> {
    model
        .children
        .iter()
        .filter(|c| c.name == "field")
        .find(|c| c.attr("name").is_some_and(|n| n.eq_ignore_ascii_case("role")))
        .and_then(|field| {
            field
                .children_named("value")
                .next()
                .map(|v| v.text.as_str())
                .or(Some(field.text.as_str()))
        })
        .map(|role| role.trim().to_ascii_lowercase())
        .filter(|role| !role.is_empty())
}

/// `/`-separated, without leading `./` or `/`.
pub fn normalize_rel_path(raw: &str) -> String {
    let mut s = raw.trim().replace('\\', "/");
    while let Some(rest) = s.strip_prefix("./") {
        s = rest.to_string();
    }
    s.trim_start_matches('/').to_string()
}

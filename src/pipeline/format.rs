//! Pipeline text format.
//!
//! ```text
//! CellPipe Pipeline: cellpipe
//! Version:3
//! DateRevision:20260901
//! ModuleCount:2
//! MessageForUser:Note|Run on the cluster
//!
//! LoadImages:[module_num:1|svn_version:'Unknown'|variable_revision_number:3|...]
//!     Input image folder:/local/data
//!     File names end with:.png
//!
//! MeasureImageIntensity:[module_num:2|...]
//!     Select the image to measure:DNA
//! ```
//!
//! Setting text and record attributes escape `\ | [ ] :` and line breaks as
//! `\xHH`; setting values only escape backslashes and line breaks, so a line
//! always splits on its first `:`.

use crate::pipeline::error::{PipelineError, PipelineResult};

pub const HEADER: &str = "CellPipe Pipeline: cellpipe";
/// Current format version.
pub const NATIVE_VERSION: u32 = 3;
/// Records written by the first release; only readable through a module's
/// legacy converter.
pub const LEGACY_VERSION: u32 = 1;
pub const DATE_REVISION: u32 = 20260901;

const MATLAB_PREFIX: &str = "MATLAB";
const SETTING_INDENT: &str = "    ";

const H_VERSION: &str = "Version";
const H_DATE_REVISION: &str = "DateRevision";
const H_MODULE_COUNT: &str = "ModuleCount";
const H_BATCH_MODE: &str = "BatchMode";
const H_MESSAGE_FOR_USER: &str = "MessageForUser";
const H_GIT_HASH: &str = "GitHash";

const A_MODULE_NUM: &str = "module_num";
const A_SVN_VERSION: &str = "svn_version";
const A_REVISION: &str = "variable_revision_number";
const A_SHOW_WINDOW: &str = "show_window";
const A_NOTES: &str = "notes";
const A_BATCH_STATE: &str = "batch_state";
const A_ENABLED: &str = "enabled";
const A_WANTS_PAUSE: &str = "wants_pause";

/// One serialized module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRecord {
    pub class_name: String,
    pub module_num: Option<u32>,
    pub revision: u32,
    pub show_window: bool,
    pub enabled: bool,
    pub wants_pause: bool,
    pub notes: Vec<String>,
    pub batch_state: Vec<u8>,
    /// `(setting text, value)` in serialization order.
    pub settings: Vec<(String, String)>,
    /// Written by a format version whose values need a legacy conversion.
    pub from_legacy: bool,
}

impl ModuleRecord {
    pub fn new(class_name: impl Into<String>, revision: u32) -> Self {
        Self {
            class_name: class_name.into(),
            module_num: None,
            revision,
            show_window: false,
            enabled: true,
            wants_pause: false,
            notes: Vec::new(),
            batch_state: Vec::new(),
            settings: Vec::new(),
            from_legacy: false,
        }
    }

    pub fn values(&self) -> Vec<String> {
        self.settings.iter().map(|(_, v)| v.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDocument {
    pub version: u32,
    pub date_revision: u32,
    pub batch_mode: bool,
    pub message_for_user: Option<(String, String)>,
    pub records: Vec<ModuleRecord>,
}

impl Default for PipelineDocument {
    fn default() -> Self {
        Self {
            version: NATIVE_VERSION,
            date_revision: DATE_REVISION,
            batch_mode: false,
            message_for_user: None,
            records: Vec::new(),
        }
    }
}

// ==================== Escaping ====================

fn escape_with(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if special.contains(&c) {
            out.push_str(&format!("\\x{:02x}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape setting text and attribute values.
pub fn escape_text(text: &str) -> String {
    escape_with(text, &['\\', '|', '[', ']', ':', '\n', '\r', '\t'])
}

/// Escape a setting value.
pub fn escape_value(value: &str) -> String {
    escape_with(value, &['\\', '\n', '\r'])
}

pub fn unescape(text: &str, line: usize) -> PipelineResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escape: String = chars.by_ref().take(3).collect();
        let decoded = escape
            .strip_prefix('x')
            .filter(|hex| hex.len() == 2)
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32)
            .ok_or_else(|| PipelineError::parse(line, format!("bad escape \"\\{}\"", escape)))?;
        out.push(decoded);
    }
    Ok(out)
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(text: &str, line: usize) -> PipelineResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(PipelineError::parse(line, "batch state has an odd number of hex digits"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| PipelineError::parse(line, "batch state is not hex"))
        })
        .collect()
}

fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn parse_bool(value: &str, line: usize) -> PipelineResult<bool> {
    match value {
        "True" | "true" | "Yes" => Ok(true),
        "False" | "false" | "No" => Ok(false),
        other => Err(PipelineError::parse(line, format!("expected True or False, got \"{}\"", other))),
    }
}

fn parse_u32(value: &str, what: &str, line: usize) -> PipelineResult<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::parse(line, format!("{} must be a number, got \"{}\"", what, value)))
}

// ==================== Writing ====================

pub fn write(doc: &PipelineDocument) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    out.push_str(&format!("{}:{}\n", H_VERSION, doc.version));
    out.push_str(&format!("{}:{}\n", H_DATE_REVISION, doc.date_revision));
    out.push_str(&format!("{}:{}\n", H_MODULE_COUNT, doc.records.len()));
    if doc.batch_mode {
        out.push_str(&format!("{}:{}\n", H_BATCH_MODE, format_bool(true)));
    }
    if let Some((caption, message)) = &doc.message_for_user {
        out.push_str(&message_line(caption, message));
    }

    for (i, record) in doc.records.iter().enumerate() {
        out.push('\n');
        let module_num = record.module_num.unwrap_or(i as u32 + 1);
        // Vec<String> always serializes
        let notes = serde_json::to_string(&record.notes).unwrap_or_else(|_| "[]".into());
        let attributes = [
            (A_MODULE_NUM, module_num.to_string()),
            (A_SVN_VERSION, "'Unknown'".to_string()),
            (A_REVISION, record.revision.to_string()),
            (A_SHOW_WINDOW, format_bool(record.show_window).to_string()),
            (A_NOTES, notes),
            (A_BATCH_STATE, encode_hex(&record.batch_state)),
            (A_ENABLED, format_bool(record.enabled).to_string()),
            (A_WANTS_PAUSE, format_bool(record.wants_pause).to_string()),
        ];
        let attributes: Vec<String> = attributes
            .iter()
            .map(|(k, v)| format!("{}:{}", k, escape_text(v)))
            .collect();
        out.push_str(&format!("{}:[{}]\n", record.class_name, attributes.join("|")));
        for (text, value) in &record.settings {
            out.push_str(&format!(
                "{}{}:{}\n",
                SETTING_INDENT,
                escape_text(text),
                escape_value(value)
            ));
        }
    }
    out
}

fn message_line(caption: &str, message: &str) -> String {
    format!(
        "{}:{}|{}\n",
        H_MESSAGE_FOR_USER,
        escape_text(caption),
        escape_text(message)
    )
}

/// Insert a message-for-user header line without touching module records.
///
/// Any previous message is replaced.
pub fn add_message_for_user(text: &str, caption: &str, message: &str) -> PipelineResult<String> {
    if text.starts_with(MATLAB_PREFIX) {
        return Err(PipelineError::LegacyFormat(
            "cannot annotate a MATLAB pipeline".into(),
        ));
    }
    // `lines` also strips `\r`, so CRLF files split at the same blank line
    // and come back with plain newlines.
    let lines: Vec<&str> = text.lines().collect();
    let split = lines.iter().position(|l| l.is_empty()).unwrap_or(lines.len());
    let (header, body) = lines.split_at(split);
    if !header.first().is_some_and(|l| l.starts_with(HEADER)) {
        return Err(PipelineError::parse(1, "not a pipeline file"));
    }

    let message_prefix = format!("{}:", H_MESSAGE_FOR_USER);
    let mut out = String::with_capacity(text.len() + caption.len() + message.len() + 20);
    for line in header.iter().filter(|l| !l.starts_with(&message_prefix)) {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&message_line(caption, message));
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

// ==================== Parsing ====================

pub fn parse(text: &str) -> PipelineResult<PipelineDocument> {
    if text.starts_with(MATLAB_PREFIX) {
        return Err(PipelineError::LegacyFormat(
            "MATLAB pipelines must be converted with a release that still reads them".into(),
        ));
    }

    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l)).peekable();
    match lines.next() {
        Some((_, first)) if first.trim_end() == HEADER => {}
        Some((line, first)) => {
            return Err(PipelineError::parse(
                line,
                format!("expected \"{}\", got \"{}\"", HEADER, first),
            ))
        }
        None => return Err(PipelineError::parse(1, "empty pipeline text")),
    }

    let mut doc = PipelineDocument {
        version: LEGACY_VERSION,
        ..PipelineDocument::default()
    };
    let mut module_count = None;

    // Header lines run up to the first blank line.
    while let Some(&(line, raw)) = lines.peek() {
        if raw.trim().is_empty() {
            break;
        }
        lines.next();
        let (key, value) = raw
            .split_once(':')
            .ok_or_else(|| PipelineError::parse(line, format!("expected \"Key:Value\", got \"{}\"", raw)))?;
        match key {
            H_VERSION => doc.version = parse_u32(value, H_VERSION, line)?,
            H_DATE_REVISION => doc.date_revision = parse_u32(value, H_DATE_REVISION, line)?,
            H_MODULE_COUNT => module_count = Some(parse_u32(value, H_MODULE_COUNT, line)? as usize),
            H_BATCH_MODE => doc.batch_mode = parse_bool(value.trim(), line)?,
            H_MESSAGE_FOR_USER => {
                let (caption, message) = value.split_once('|').unwrap_or(("", value));
                doc.message_for_user = Some((unescape(caption, line)?, unescape(message, line)?));
            }
            H_GIT_HASH => {}
            other => tracing::warn!("Ignoring unknown pipeline header \"{}\" at line {}", other, line),
        }
    }
    if doc.version > NATIVE_VERSION {
        return Err(PipelineError::UnsupportedVersion(doc.version));
    }
    let from_legacy = doc.version <= LEGACY_VERSION;

    while let Some((line, raw)) = lines.next() {
        if raw.trim().is_empty() {
            continue;
        }
        if raw.starts_with(char::is_whitespace) {
            return Err(PipelineError::parse(line, "setting outside of a module record"));
        }
        let mut record = parse_record_line(raw, line)?;
        record.from_legacy = from_legacy;

        while let Some(&(line, raw)) = lines.peek() {
            if raw.trim().is_empty() || !raw.starts_with(char::is_whitespace) {
                break;
            }
            lines.next();
            let (text, value) = raw
                .trim_start()
                .split_once(':')
                .ok_or_else(|| PipelineError::parse(line, format!("expected \"text:value\", got \"{}\"", raw.trim())))?;
            record.settings.push((unescape(text, line)?, unescape(value, line)?));
        }
        doc.records.push(record);
    }

    if let Some(expected) = module_count {
        if expected != doc.records.len() {
            return Err(PipelineError::parse(
                0,
                format!(
                    "header declares {} modules but {} were found",
                    expected,
                    doc.records.len()
                ),
            ));
        }
    }
    Ok(doc)
}

fn parse_record_line(raw: &str, line: usize) -> PipelineResult<ModuleRecord> {
    let (class_name, attributes) = raw
        .split_once(":[")
        .ok_or_else(|| PipelineError::parse(line, format!("expected \"Module:[...]\", got \"{}\"", raw)))?;
    let attributes = attributes
        .trim_end()
        .strip_suffix(']')
        .ok_or_else(|| PipelineError::parse(line, "unterminated module attributes"))?;
    if class_name.is_empty() {
        return Err(PipelineError::parse(line, "missing module name"));
    }

    let mut record = ModuleRecord::new(class_name.trim(), 0);
    let mut has_revision = false;
    for attribute in attributes.split('|').filter(|a| !a.is_empty()) {
        let (key, value) = attribute
            .split_once(':')
            .ok_or_else(|| PipelineError::parse(line, format!("malformed attribute \"{}\"", attribute)))?;
        let value = unescape(value, line)?;
        match key {
            A_MODULE_NUM => record.module_num = Some(parse_u32(&value, key, line)?),
            A_REVISION => {
                record.revision = parse_u32(&value, key, line)?;
                has_revision = true;
            }
            A_SHOW_WINDOW => record.show_window = parse_bool(&value, line)?,
            A_ENABLED => record.enabled = parse_bool(&value, line)?,
            A_WANTS_PAUSE => record.wants_pause = parse_bool(&value, line)?,
            A_BATCH_STATE => record.batch_state = decode_hex(&value, line)?,
            A_NOTES => {
                record.notes = serde_json::from_str(&value)
                    .map_err(|e| PipelineError::parse(line, format!("notes: {}", e)))?
            }
            A_SVN_VERSION => {}
            other => tracing::debug!("Ignoring module attribute \"{}\" at line {}", other, line),
        }
    }
    if !has_revision {
        return Err(PipelineError::parse(
            line,
            format!("{} record has no {}", class_name, A_REVISION),
        ));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> PipelineDocument {
        let mut load = ModuleRecord::new("LoadImages", 3);
        load.notes = vec!["Scan the plate".into(), "second | line".into()];
        load.batch_state = vec![0x00, 0x7f, 0xff];
        load.settings = vec![
            ("Input folder".into(), "/local/data".into()),
            ("Metadata keys: ordered".into(), "Plate,Well:Site".into()),
        ];
        let mut measure = ModuleRecord::new("MeasureImageIntensity", 2);
        measure.show_window = true;
        measure.enabled = false;
        measure.settings = vec![("Select the image to measure".into(), "DNA".into())];
        PipelineDocument {
            records: vec![load, measure],
            ..PipelineDocument::default()
        }
    }

    #[test]
    fn test_round_trip() {
        let doc = sample();
        let text = write(&doc);
        let mut parsed = parse(&text).unwrap();
        for r in &mut parsed.records {
            r.module_num = None;
        }
        assert_eq!(parsed, doc);
        assert_eq!(write(&parse(&text).unwrap()), text);
    }

    #[test]
    fn test_colon_in_setting_text_is_escaped() {
        let text = write(&sample());
        assert!(text.contains("    Metadata keys\\x3a ordered:Plate,Well:Site\n"));
    }

    #[test]
    fn test_matlab_rejected() {
        let err = parse("MATLAB 5.0 MAT-file, Platform: GLNXA64").unwrap_err();
        assert!(matches!(err, PipelineError::LegacyFormat(_)));
    }

    #[test]
    fn test_newer_version_rejected() {
        let text = format!("{}\nVersion:9\n\n", HEADER);
        assert!(matches!(parse(&text), Err(PipelineError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_version_one_is_legacy() {
        let text = format!(
            "{}\nVersion:1\n\nFlagImage:[variable_revision_number:1]\n    Name the flag:QC\n",
            HEADER
        );
        let doc = parse(&text).unwrap();
        assert!(doc.records[0].from_legacy);
        assert_eq!(doc.records[0].values(), vec!["QC"]);
    }

    #[test]
    fn test_module_count_mismatch() {
        let mut text = write(&sample());
        text = text.replace("ModuleCount:2", "ModuleCount:3");
        assert!(matches!(parse(&text), Err(PipelineError::Parse { .. })));
    }

    #[test]
    fn test_bad_escape_reports_line() {
        let text = format!(
            "{}\nVersion:3\n\nFlagImage:[variable_revision_number:1]\n    Name:\\q1\n",
            HEADER
        );
        assert!(matches!(parse(&text), Err(PipelineError::Parse { line: 5, .. })));
    }

    #[test]
    fn test_add_message_for_user_keeps_records() {
        let text = write(&sample());
        let annotated = add_message_for_user(&text, "Batch", "Run me\non the cluster").unwrap();
        let doc = parse(&annotated).unwrap();
        assert_eq!(
            doc.message_for_user,
            Some(("Batch".into(), "Run me\non the cluster".into()))
        );
        assert_eq!(doc.records.len(), 2);

        let replaced = add_message_for_user(&annotated, "Other", "x").unwrap();
        assert_eq!(replaced.matches(H_MESSAGE_FOR_USER).count(), 1);
    }

    #[test]
    fn test_add_message_for_user_to_crlf_file() {
        let text = write(&sample());
        let crlf = text.replace('\n', "\r\n");
        let annotated = add_message_for_user(&crlf, "Batch", "Windows").unwrap();

        let doc = parse(&annotated).unwrap();
        assert_eq!(doc.message_for_user, Some(("Batch".into(), "Windows".into())));
        assert_eq!(doc.records, parse(&text).unwrap().records);
        let header_end = annotated.find("\n\n").unwrap();
        assert!(annotated[..header_end].contains(H_MESSAGE_FOR_USER));
    }

    proptest! {
        #[test]
        fn prop_escaping_round_trips(text in "\\PC*", value in ".*") {
            prop_assert_eq!(unescape(&escape_text(&text), 1).unwrap(), text.clone());
            prop_assert!(!escape_text(&text).contains(':'));
            prop_assert_eq!(unescape(&escape_value(&value), 1).unwrap(), value);
        }
    }
}

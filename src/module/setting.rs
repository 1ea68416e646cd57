//! Typed, named module settings.
//!
//! A `Setting` always stores its value as text, exactly as it appears in a
//! saved pipeline. The `SettingKind` decides how that text is interpreted and
//! validated, so binding a value during load can never fail; problems surface
//! later through `test_valid`.

use crate::pipeline::error::ValidationError;
use std::path::Path;
use uuid::Uuid;

pub const YES: &str = "Yes";
pub const NO: &str = "No";

/// The name a provider or subscriber setting refers to when unset.
pub const NONE_NAME: &str = "None";

/// Namespace for names that modules provide to downstream modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameGroup {
    Image,
    Object,
}

/// How a setting's text value is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingKind {
    Text,
    Integer { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Binary,
    Choice(Vec<String>),
    NameProvider(NameGroup),
    NameSubscriber(NameGroup),
    Measurement,
    DirectoryPath,
}

/// Names visible to a module during validation.
///
/// Built by the pipeline from the modules upstream of the one being checked.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    provided: Vec<(NameGroup, String)>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&mut self, group: NameGroup, name: impl Into<String>) {
        self.provided.push((group, name.into()));
    }

    pub fn is_provided(&self, group: NameGroup, name: &str) -> bool {
        self.provided.iter().any(|(g, n)| *g == group && n == name)
    }

    pub fn names(&self, group: NameGroup) -> impl Iterator<Item = &str> {
        self.provided
            .iter()
            .filter(move |(g, _)| *g == group)
            .map(|(_, n)| n.as_str())
    }
}

/// One typed, named configuration value owned by a module.
#[derive(Debug, Clone)]
pub struct Setting {
    key: Uuid,
    text: String,
    value: String,
    doc: String,
    kind: SettingKind,
}

impl Setting {
    pub fn new(text: impl Into<String>, value: impl Into<String>, kind: SettingKind) -> Self {
        Self {
            key: Uuid::new_v4(),
            text: text.into(),
            value: value.into(),
            doc: String::new(),
            kind,
        }
    }

    pub fn text_value(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::Text)
    }

    pub fn integer(text: impl Into<String>, value: i64, min: Option<i64>, max: Option<i64>) -> Self {
        Self::new(text, value.to_string(), SettingKind::Integer { min, max })
    }

    pub fn float(text: impl Into<String>, value: f64, min: Option<f64>, max: Option<f64>) -> Self {
        Self::new(text, value.to_string(), SettingKind::Float { min, max })
    }

    pub fn binary(text: impl Into<String>, value: bool) -> Self {
        Self::new(text, if value { YES } else { NO }, SettingKind::Binary)
    }

    pub fn choice(text: impl Into<String>, options: &[&str], value: impl Into<String>) -> Self {
        let options = options.iter().map(|o| o.to_string()).collect();
        Self::new(text, value, SettingKind::Choice(options))
    }

    pub fn image_provider(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::NameProvider(NameGroup::Image))
    }

    pub fn image_subscriber(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::NameSubscriber(NameGroup::Image))
    }

    pub fn object_provider(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::NameProvider(NameGroup::Object))
    }

    pub fn object_subscriber(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::NameSubscriber(NameGroup::Object))
    }

    pub fn measurement(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::Measurement)
    }

    pub fn directory(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(text, value, SettingKind::DirectoryPath)
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    // ── Accessors ──

    /// Stable identity used to point validation errors at this setting.
    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn kind(&self) -> &SettingKind {
        &self.kind
    }

    /// The raw text value, as serialized.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Bind a raw text value. Interpretation is deferred to `test_valid`.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    pub fn is_yes(&self) -> bool {
        self.value == YES
    }

    pub fn set_bool(&mut self, value: bool) {
        self.value = if value { YES } else { NO }.to_string();
    }

    pub fn as_i64(&self) -> Result<i64, ValidationError> {
        self.value
            .trim()
            .parse()
            .map_err(|_| ValidationError::new(format!("\"{}\" is not an integer", self.value), self))
    }

    pub fn as_f64(&self) -> Result<f64, ValidationError> {
        self.value
            .trim()
            .parse()
            .map_err(|_| ValidationError::new(format!("\"{}\" is not a number", self.value), self))
    }

    /// Whether this provider or subscriber setting names something.
    pub fn is_named(&self) -> bool {
        !self.value.is_empty() && self.value != NONE_NAME
    }

    /// The name this setting provides to downstream modules, if any.
    pub fn provided_name(&self) -> Option<(NameGroup, &str)> {
        match self.kind {
            SettingKind::NameProvider(group) if self.is_named() => Some((group, &self.value)),
            _ => None,
        }
    }

    // ── Validation ──

    /// Check the value against its kind.
    pub fn test_valid(&self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        match &self.kind {
            SettingKind::Text | SettingKind::DirectoryPath => Ok(()),
            SettingKind::Integer { min, max } => {
                let v = self.as_i64()?;
                check_bounds(self, v, *min, *max)
            }
            SettingKind::Float { min, max } => {
                let v = self.as_f64()?;
                if v.is_nan() {
                    return Err(ValidationError::new("Value must be a number", self));
                }
                check_bounds(self, v, *min, *max)
            }
            SettingKind::Binary => {
                if self.value == YES || self.value == NO {
                    Ok(())
                } else {
                    Err(ValidationError::new(
                        format!("\"{}\" must be {} or {}", self.value, YES, NO),
                        self,
                    ))
                }
            }
            SettingKind::Choice(options) => {
                if options.iter().any(|o| *o == self.value) {
                    Ok(())
                } else {
                    Err(ValidationError::new(
                        format!(
                            "\"{}\" is not one of the choices: {}",
                            self.value,
                            options.join(", ")
                        ),
                        self,
                    ))
                }
            }
            SettingKind::NameProvider(_) => {
                if self.is_named() {
                    Ok(())
                } else {
                    Err(ValidationError::new("A name must be provided", self))
                }
            }
            SettingKind::NameSubscriber(group) => {
                if !self.is_named() {
                    Err(ValidationError::new("No input selected", self))
                } else if !ctx.is_provided(*group, &self.value) {
                    Err(ValidationError::new(
                        format!("\"{}\" is not provided by an earlier module", self.value),
                        self,
                    ))
                } else {
                    Ok(())
                }
            }
            SettingKind::Measurement => {
                if self.value.is_empty() || self.value == NONE_NAME {
                    Err(ValidationError::new("No measurement selected", self))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Non-fatal advice about the value.
    pub fn test_setting_warnings(&self) -> Result<(), ValidationError> {
        if self.kind == SettingKind::DirectoryPath && !Path::new(&self.value).is_dir() {
            return Err(ValidationError::new(
                format!("Folder \"{}\" does not exist on this host", self.value),
                self,
            ));
        }
        Ok(())
    }
}

fn check_bounds<T: PartialOrd + std::fmt::Display>(
    setting: &Setting,
    value: T,
    min: Option<T>,
    max: Option<T>,
) -> Result<(), ValidationError> {
    if let Some(min) = min {
        if value < min {
            return Err(ValidationError::new(
                format!("Must be at least {}, was {}", min, value),
                setting,
            ));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(ValidationError::new(
                format!("Must be at most {}, was {}", max, value),
                setting,
            ));
        }
    }
    Ok(())
}

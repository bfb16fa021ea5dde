//! Reference discovery in raw schema documents.
//!
//! Schema text is scanned before compilation to learn its target namespace
//! and the import/include/redefine references it makes, so dependencies can
//! be fetched and compiled first. Scanning is regex based and tolerant of
//! any namespace prefix on the schema elements.

use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;

use crate::artifact::EdgeKind;

/// Cached regex for XML comments
static COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();

/// Cached regex for the root schema element
static SCHEMA_ELEMENT_REGEX: OnceLock<Regex> = OnceLock::new();

/// Cached regex for import/include/redefine elements
static REFERENCE_ELEMENT_REGEX: OnceLock<Regex> = OnceLock::new();

/// Cached regex for attributes of interest
static ATTRIBUTE_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_comment_regex() -> &'static Regex {
    COMMENT_REGEX
        .get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("Failed to compile comment regex"))
}

fn get_schema_element_regex() -> &'static Regex {
    SCHEMA_ELEMENT_REGEX.get_or_init(|| {
        Regex::new(r"<(?:[A-Za-z_][\w.\-]*:)?schema\b([^>]*)>")
            .expect("Failed to compile schema element regex")
    })
}

fn get_reference_element_regex() -> &'static Regex {
    REFERENCE_ELEMENT_REGEX.get_or_init(|| {
        Regex::new(r"<(?:[A-Za-z_][\w.\-]*:)?(import|include|redefine)\b([^>]*)>")
            .expect("Failed to compile reference element regex")
    })
}

fn get_attribute_regex() -> &'static Regex {
    ATTRIBUTE_REGEX.get_or_init(|| {
        Regex::new(r#"\b(targetNamespace|namespace|schemaLocation)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile attribute regex")
    })
}

/// One outgoing reference of a schema document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaReference {
    pub kind: EdgeKind,
    /// `schemaLocation` as written
    pub location: Option<String>,
    /// `namespace` of an import
    pub namespace: Option<String>,
}

impl SchemaReference {
    /// Human-readable form used in error context
    pub fn describe(&self) -> String {
        match (&self.location, &self.namespace) {
            (Some(location), _) => location.clone(),
            (None, Some(namespace)) => format!("namespace {}", namespace),
            (None, None) => "<no-namespace import>".to_string(),
        }
    }
}

/// What the scanner learned about one schema document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScannedSchema {
    pub target_namespace: Option<String>,
    pub has_doctype: bool,
    pub references: Vec<SchemaReference>,
}

impl ScannedSchema {
    pub fn imports(&self) -> impl Iterator<Item = &SchemaReference> {
        self.references
            .iter()
            .filter(|r| r.kind == EdgeKind::Import)
    }

    pub fn includes(&self) -> impl Iterator<Item = &SchemaReference> {
        self.references
            .iter()
            .filter(|r| r.kind == EdgeKind::Include)
    }
}

/// Scan schema text for its target namespace, DOCTYPE and references
pub fn scan(text: &str) -> ScannedSchema {
    let stripped = get_comment_regex().replace_all(text, "");

    let has_doctype = stripped.contains("<!DOCTYPE");

    let target_namespace = get_schema_element_regex()
        .captures(&stripped)
        .and_then(|caps| attribute(&caps[1], "targetNamespace"))
        .filter(|ns| !ns.is_empty());

    let mut references = Vec::new();
    for caps in get_reference_element_regex().captures_iter(&stripped) {
        let kind = match &caps[1] {
            "import" => EdgeKind::Import,
            _ => EdgeKind::Include,
        };
        let attributes = &caps[2];
        let location = attribute(attributes, "schemaLocation").filter(|l| !l.trim().is_empty());
        let namespace = match kind {
            EdgeKind::Import => attribute(attributes, "namespace").filter(|n| !n.is_empty()),
            EdgeKind::Include => None,
        };
        let reference = SchemaReference {
            kind,
            location: location.map(|l| l.trim().to_string()),
            namespace,
        };
        // An import with neither attribute names nothing resolvable
        if reference.location.is_none() && reference.namespace.is_none() {
            continue;
        }
        if !references.contains(&reference) {
            references.push(reference);
        }
    }

    ScannedSchema {
        target_namespace,
        has_doctype,
        references,
    }
}

/// Target namespace declared by a schema document, if any
pub fn target_namespace(text: &str) -> Option<String> {
    scan(text).target_namespace
}

fn attribute(attributes: &str, name: &str) -> Option<String> {
    get_attribute_regex()
        .captures_iter(attributes)
        .find(|caps| &caps[1] == name)
        .and_then(|caps| caps.get(2).or_else(|| caps.get(3)))
        .map(|m| unescape(m.as_str()))
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn is_hierarchical(scheme: &str) -> bool {
    matches!(scheme, "http" | "https" | "file")
}

/// Normalise http, https and file URLs; leave every other URI as written
pub fn canonical_uri(uri: &str) -> String {
    let uri = uri.trim();
    match Url::parse(uri) {
        Ok(url) if is_hierarchical(url.scheme()) => url.to_string(),
        _ => uri.to_string(),
    }
}

/// Resolve a `schemaLocation` against the system id of the referencing document
pub fn resolve_location(base: &str, location: &str) -> String {
    let location = location.trim();
    if Url::parse(location).is_ok() {
        return canonical_uri(location);
    }
    match Url::parse(base) {
        Ok(base_url) if is_hierarchical(base_url.scheme()) => base_url
            .join(location)
            .map(|joined| joined.to_string())
            .unwrap_or_else(|_| location.to_string()),
        _ => location.to_string(),
    }
}

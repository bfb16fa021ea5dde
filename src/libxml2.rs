//! libxml2-backed [`SchemaEngine`].
//!
//! Schemas are compiled from memory. Imports and includes are never fetched
//! by libxml2 itself: during a compile, an external entity loader hook serves
//! the text of the dependencies the cache already compiled, and refuses
//! everything else. Documents are parsed with `XML_PARSE_NONET`.
//!
//! Schema parsing is not thread-safe in libxml2. The cache serializes
//! compiles under its write lock. Validation against a parsed schema is
//! thread-safe as long as every call uses its own validation context, which
//! [`LibXml2Validator`] does.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::sync::{Arc, Once};

use libc::{c_char, c_int, c_void};
use tracing::debug;

use crate::artifact::CompiledArtifact;
use crate::engine::{CompilationUnit, SchemaEngine, SchemaValidator, ValidationResult};
use crate::error::{EngineError, EngineResult};

static LIBXML2_INIT: Once = Once::new();

/// `XML_PARSE_NONET`: forbid network access while parsing
const XML_PARSE_NONET: c_int = 1 << 11;

#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserInput {
    _private: [u8; 0],
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc = Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

pub type XmlExternalEntityLoader = Option<
    unsafe extern "C" fn(url: *const c_char, id: *const c_char, ctxt: *mut c_void) -> *mut XmlParserInput,
>;

#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    fn xmlInitParser();
    fn xmlInitGlobals();

    fn xmlSchemaNewMemParserCtxt(buffer: *const c_char, size: c_int) -> *mut XmlSchemaParserCtxt;
    fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    fn xmlSchemaParse(ctxt: *const XmlSchemaParserCtxt) -> *mut XmlSchema;
    fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    fn xmlSchemaFree(schema: *mut XmlSchema);

    fn xmlSchemaNewValidCtxt(schema: *const XmlSchema) -> *mut XmlSchemaValidCtxt;
    fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    fn xmlSchemaValidateDoc(ctxt: *mut XmlSchemaValidCtxt, doc: *mut XmlDoc) -> c_int;

    fn xmlReadMemory(
        buffer: *const c_char,
        size: c_int,
        url: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    fn xmlFreeDoc(doc: *mut XmlDoc);

    fn xmlSetExternalEntityLoader(loader: XmlExternalEntityLoader);
    fn xmlNewStringInputStream(ctxt: *mut c_void, buffer: *const u8) -> *mut XmlParserInput;
}

thread_local! {
    /// Dependency texts visible to the entity loader during a compile on this thread
    static LOADER_SOURCES: RefCell<Option<HashMap<String, CString>>> = const { RefCell::new(None) };
}

/// Callback for libxml2 to report parse and validation errors (structured)
unsafe extern "C" fn structured_error_callback(user_data: *mut c_void, error: *mut xmlError) {
    let errors = unsafe { &mut *(user_data as *mut Vec<String>) };

    if !error.is_null() {
        let msg_ptr = unsafe { (*error).message };
        if !msg_ptr.is_null() {
            let c_str = unsafe { CStr::from_ptr(msg_ptr) };
            if let Ok(s) = c_str.to_str() {
                errors.push(s.trim().to_string());
            }
        }
    }
}

/// Serves compiled dependency texts; every other URL fails to load
unsafe extern "C" fn dependency_loader(
    url: *const c_char,
    _id: *const c_char,
    ctxt: *mut c_void,
) -> *mut XmlParserInput {
    if url.is_null() {
        return std::ptr::null_mut();
    }
    let url = unsafe { CStr::from_ptr(url) }.to_string_lossy();
    LOADER_SOURCES.with(|sources| {
        let sources = sources.borrow();
        match sources.as_ref().and_then(|map| map.get(url.as_ref())) {
            Some(text) => unsafe { xmlNewStringInputStream(ctxt, text.as_ptr() as *const u8) },
            None => std::ptr::null_mut(),
        }
    })
}

/// Clears the loader map when a compile ends, however it ends
struct LoaderScope;

impl LoaderScope {
    fn install(sources: HashMap<String, CString>) -> Self {
        LOADER_SOURCES.with(|slot| *slot.borrow_mut() = Some(sources));
        LoaderScope
    }
}

impl Drop for LoaderScope {
    fn drop(&mut self) {
        LOADER_SOURCES.with(|slot| *slot.borrow_mut() = None);
    }
}

/// Owned libxml2 schema, freed on drop
#[derive(Debug)]
struct XmlSchemaPtr {
    ptr: *mut XmlSchema,
    _phantom: PhantomData<XmlSchema>,
}

// Safety: parsed xmlSchema structures are read-only during validation
unsafe impl Send for XmlSchemaPtr {}
unsafe impl Sync for XmlSchemaPtr {}

impl Drop for XmlSchemaPtr {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                xmlSchemaFree(self.ptr);
            }
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// [`SchemaEngine`] over the system libxml2
pub struct LibXml2Engine {
    _phantom: PhantomData<()>,
}

impl LibXml2Engine {
    pub fn new() -> Self {
        LIBXML2_INIT.call_once(|| unsafe {
            xmlInitParser();
            xmlInitGlobals();
            xmlSetExternalEntityLoader(Some(dependency_loader));
        });

        LibXml2Engine {
            _phantom: PhantomData,
        }
    }
}

impl Default for LibXml2Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Every transitive dependency text, keyed by each name it may be loaded under
fn loader_sources(unit: &CompilationUnit<'_>) -> HashMap<String, CString> {
    fn add(map: &mut HashMap<String, CString>, key: &str, artifact: &CompiledArtifact) {
        if let Ok(text) = CString::new(artifact.schema_text()) {
            map.entry(key.to_string()).or_insert(text);
        }
    }

    // Nested references are keyed both by system id and as written in the parent
    fn children(
        artifact: &CompiledArtifact,
        map: &mut HashMap<String, CString>,
    ) -> Vec<Arc<CompiledArtifact>> {
        let locations = artifact.locations();
        artifact
            .dependency_edges()
            .into_iter()
            .map(|(_, child)| {
                add(map, child.system_id(), &child);
                for (location, uri) in &locations {
                    if uri == child.system_id() {
                        add(map, location, &child);
                    }
                }
                child
            })
            .collect()
    }

    let mut map = HashMap::new();
    let mut stack = Vec::new();
    for dependency in &unit.dependencies {
        if let Some(location) = dependency.location {
            add(&mut map, location, dependency.artifact);
        }
        add(&mut map, dependency.system_id, dependency.artifact);
        stack.extend(children(dependency.artifact, &mut map));
    }

    let mut visited = HashSet::new();
    while let Some(artifact) = stack.pop() {
        if visited.insert(artifact.id()) {
            stack.extend(children(&artifact, &mut map));
        }
    }
    map
}

impl SchemaEngine for LibXml2Engine {
    fn compile(&self, unit: &CompilationUnit<'_>) -> EngineResult<Arc<dyn SchemaValidator>> {
        let sources = loader_sources(unit);
        debug!(uri = %unit.system_id, loadable = sources.len(), "Parsing schema with libxml2");
        let _scope = LoaderScope::install(sources);

        let text = unit.text.as_bytes();
        let size = c_int::try_from(text.len()).map_err(|_| EngineError::SchemaParseFailed {
            details: "schema text too large".to_string(),
        })?;

        unsafe {
            let parser_ctxt = xmlSchemaNewMemParserCtxt(text.as_ptr() as *const c_char, size);
            if parser_ctxt.is_null() {
                return Err(EngineError::MemoryAllocation);
            }

            let mut errors: Vec<String> = Vec::new();
            xmlSchemaSetParserStructuredErrors(
                parser_ctxt,
                Some(structured_error_callback),
                &mut errors as *mut Vec<String> as *mut c_void,
            );

            let schema_ptr = xmlSchemaParse(parser_ctxt);
            xmlSchemaFreeParserCtxt(parser_ctxt);

            if schema_ptr.is_null() {
                let details = if errors.is_empty() {
                    "libxml2 could not parse the schema".to_string()
                } else {
                    errors.join("; ")
                };
                return Err(EngineError::SchemaParseFailed { details });
            }

            Ok(Arc::new(LibXml2Validator {
                schema: XmlSchemaPtr {
                    ptr: schema_ptr,
                    _phantom: PhantomData,
                },
            }))
        }
    }
}

/// Validates in-memory documents against one parsed schema
pub struct LibXml2Validator {
    schema: XmlSchemaPtr,
}

impl SchemaValidator for LibXml2Validator {
    fn validate(&self, document: &[u8]) -> ValidationResult {
        let Ok(size) = c_int::try_from(document.len()) else {
            return ValidationResult::InternalError {
                details: "document too large".to_string(),
            };
        };

        unsafe {
            let mut errors: Vec<String> = Vec::new();
            let doc = xmlReadMemory(
                document.as_ptr() as *const c_char,
                size,
                c"document.xml".as_ptr(),
                std::ptr::null(),
                XML_PARSE_NONET,
            );
            if doc.is_null() {
                return ValidationResult::from_errors(vec![
                    "Document is not well-formed XML".to_string(),
                ]);
            }

            let valid_ctxt = xmlSchemaNewValidCtxt(self.schema.ptr);
            if valid_ctxt.is_null() {
                xmlFreeDoc(doc);
                return ValidationResult::InternalError {
                    details: "failed to create libxml2 validation context".to_string(),
                };
            }
            xmlSchemaSetValidStructuredErrors(
                valid_ctxt,
                Some(structured_error_callback),
                &mut errors as *mut Vec<String> as *mut c_void,
            );

            let code = xmlSchemaValidateDoc(valid_ctxt, doc);
            xmlSchemaFreeValidCtxt(valid_ctxt);
            xmlFreeDoc(doc);

            match code {
                0 => ValidationResult::Valid,
                n if n > 0 => ValidationResult::Invalid {
                    error_count: errors.len().max(1),
                    errors,
                },
                n => ValidationResult::InternalError {
                    details: format!("libxml2 validation returned {}", n),
                },
            }
        }
    }
}

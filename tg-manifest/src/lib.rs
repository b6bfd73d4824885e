//! Manifest interpreter.
//!
//! A wrapped binary carries a declarative JSON manifest describing the
//! execution environment to synthesize: the executable or entrypoint, an
//! optional dynamic interpreter, argument templates, and a tree of
//! environment mutations. This crate turns the parsed JSON into a
//! [`Manifest`] with every template rendered and every mutation applied.
//!
//! All rendered strings live in the arena that parsed them; the manifest
//! never owns heap memory.

#![cfg_attr(not(test), no_std)]

pub mod artifacts;

use spin::Once;

use tg_arena::Arena;
use tg_json::{self as json, Array, Object, ParseError, Value};
use tg_syscall::Errno;
use tg_util::{Out, Table, join, put_dec, put_hex};

pub use artifacts::{find_artifacts_dir, render_to_temp, search_upward};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestError {
    Json(ParseError),
    ExpectedObject,
    ExpectedArray,
    ExpectedString,
    ExpectedNumber,
    ExpectedMap,
    MissingKind,
    MissingValue,
    MissingPath,
    MissingComponents,
    MissingTemplate,
    UnknownInterpreterKind,
    /// `dyld` only makes sense on Darwin.
    UnsupportedInterpreter,
    /// Interpreter paths must be absolute.
    RelativeInterpreter,
    UnknownExecutableKind,
    /// `merge` mutations are not supported for environment variables.
    UnsupportedMutation,
    UnknownMutation,
    UnknownComponentKind,
    UnknownValueKind,
    /// Maps, byte values, and mutations cannot render to a string.
    UnrenderableValue,
    InvalidId,
    ArtifactsDirNotFound,
    ShortRandom,
    Sys(Errno),
}

impl From<ParseError> for ManifestError {
    fn from(err: ParseError) -> ManifestError {
        ManifestError::Json(err)
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// How to shape the spawned argv for a given dynamic linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpreterKind {
    #[default]
    Normal,
    LdLinux,
    /// musl's loader wants a `--` separator before the executable path.
    LdMusl,
}

impl InterpreterKind {
    pub fn name(self) -> &'static str {
        match self {
            InterpreterKind::Normal => "normal",
            InterpreterKind::LdLinux => "ld-linux",
            InterpreterKind::LdMusl => "ld-musl",
        }
    }
}

/// The fully rendered runtime record. Exactly one of `executable` and
/// `entrypoint` is expected to be set by the time the stub dispatches.
#[derive(Debug)]
pub struct Manifest<'a> {
    pub executable: Option<&'a [u8]>,
    pub entrypoint: Option<u64>,
    pub interpreter: Option<&'a [u8]>,
    pub interpreter_kind: InterpreterKind,
    pub library_paths: &'a [&'a [u8]],
    pub preloads: &'a [&'a [u8]],
    pub argv: &'a [&'a [u8]],
    pub interp_argv: &'a [&'a [u8]],
    pub env: Table<'a>,
}

// ============================================================================
// Context
// ============================================================================

/// Parsing context: the arena plus the lazily discovered artifacts
/// directory. Discovery runs at most once, and only when a manifest actually
/// references an artifact.
pub struct Cx<'a> {
    arena: &'a Arena,
    artifacts_dir: Once<&'a [u8]>,
}

impl<'a> Cx<'a> {
    pub fn new(arena: &'a Arena) -> Cx<'a> {
        Cx {
            arena,
            artifacts_dir: Once::new(),
        }
    }

    /// A context with a pre-resolved artifacts directory.
    pub fn with_artifacts_dir(arena: &'a Arena, dir: &'a [u8]) -> Cx<'a> {
        let cx = Cx::new(arena);
        cx.artifacts_dir.call_once(|| dir);
        cx
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    fn artifacts_dir(&self) -> Result<&'a [u8], ManifestError> {
        self.artifacts_dir
            .try_call_once(|| artifacts::find_artifacts_dir(self.arena))
            .map(|dir| *dir)
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Interpret manifest JSON against an environment table that has already
/// been seeded from the process environment (or left empty when suppressed).
/// Fields apply in document order; the loader-path variables derive last.
pub fn parse<'a>(
    cx: &Cx<'a>,
    env: Table<'a>,
    data: &'a [u8],
) -> Result<Manifest<'a>, ManifestError> {
    let root = json::parse(cx.arena(), data)?;
    let Value::Object(object) = root else {
        return Err(ManifestError::ExpectedObject);
    };

    let mut manifest = Manifest {
        executable: None,
        entrypoint: None,
        interpreter: None,
        interpreter_kind: InterpreterKind::Normal,
        library_paths: &[],
        preloads: &[],
        argv: &[],
        interp_argv: &[],
        env,
    };

    for (key, value) in object.iter() {
        match key {
            b"interpreter" => create_interpreter(cx, &mut manifest, value)?,
            b"executable" => create_executable(cx, &mut manifest, value)?,
            b"env" => create_env(cx, &manifest.env, value)?,
            b"args" => manifest.argv = render_template_array(cx, value)?,
            _ => {}
        }
    }

    derive_loader_paths(cx, &manifest)?;
    Ok(manifest)
}

fn expect_kind<'a>(object: &Object<'a>) -> Result<&'a [u8], ManifestError> {
    match object.get(b"kind").ok_or(ManifestError::MissingKind)? {
        Value::Str(kind) => Ok(kind),
        _ => Err(ManifestError::ExpectedString),
    }
}

fn create_interpreter<'a>(
    cx: &Cx<'a>,
    manifest: &mut Manifest<'a>,
    value: Value<'a>,
) -> Result<(), ManifestError> {
    let Value::Object(object) = value else {
        return Err(ManifestError::ExpectedObject);
    };
    manifest.interpreter_kind = match expect_kind(&object)? {
        b"normal" => InterpreterKind::Normal,
        b"ld-linux" => InterpreterKind::LdLinux,
        b"ld-musl" => InterpreterKind::LdMusl,
        b"dyld" => return Err(ManifestError::UnsupportedInterpreter),
        _ => return Err(ManifestError::UnknownInterpreterKind),
    };

    let path = object.get(b"path").ok_or(ManifestError::MissingPath)?;
    let path = render_template(cx, path)?;
    // The interpreter is opened before any cwd is meaningful.
    if !path.starts_with(b"/") {
        return Err(ManifestError::RelativeInterpreter);
    }
    manifest.interpreter = Some(path);

    if let Some(paths) = object.get(b"libraryPaths") {
        manifest.library_paths = render_template_array(cx, paths)?;
    }
    if let Some(preloads) = object.get(b"preloads") {
        manifest.preloads = render_template_array(cx, preloads)?;
    }
    if let Some(args) = object.get(b"args") {
        manifest.interp_argv = render_template_array(cx, args)?;
    }
    Ok(())
}

fn create_executable<'a>(
    cx: &Cx<'a>,
    manifest: &mut Manifest<'a>,
    value: Value<'a>,
) -> Result<(), ManifestError> {
    let Value::Object(object) = value else {
        return Err(ManifestError::ExpectedObject);
    };
    match expect_kind(&object)? {
        b"path" => {
            let value = object.get(b"value").ok_or(ManifestError::MissingValue)?;
            manifest.executable = Some(render_template(cx, value)?);
        }
        b"content" => {
            // The content lands in a fresh temp file which becomes the
            // executable path.
            let value = object.get(b"value").ok_or(ManifestError::MissingValue)?;
            let content = render_template(cx, value)?;
            manifest.executable = Some(render_to_temp(cx.arena(), &manifest.env, content)?);
        }
        b"address" => {
            let value = object.get(b"value").ok_or(ManifestError::MissingValue)?;
            let Value::Number(address) = value else {
                return Err(ManifestError::ExpectedNumber);
            };
            manifest.entrypoint = Some(address as u64);
        }
        _ => return Err(ManifestError::UnknownExecutableKind),
    }
    Ok(())
}

fn create_env<'a>(
    cx: &Cx<'a>,
    env: &Table<'a>,
    value: Value<'a>,
) -> Result<(), ManifestError> {
    let Value::Object(object) = value else {
        return Err(ManifestError::ExpectedObject);
    };
    match expect_kind(&object)? {
        b"unset" => {
            env.clear();
            Ok(())
        }
        b"set" => {
            // The payload is a map value: { kind: "map", value: { ... } }.
            let value = object.get(b"value").ok_or(ManifestError::MissingValue)?;
            let Value::Object(map) = value else {
                return Err(ManifestError::ExpectedObject);
            };
            if expect_kind(&map)? != b"map" {
                return Err(ManifestError::ExpectedMap);
            }
            let value = map.get(b"value").ok_or(ManifestError::MissingValue)?;
            let Value::Object(entries) = value else {
                return Err(ManifestError::ExpectedObject);
            };
            apply_env(cx, env, &entries)
        }
        _ => Err(ManifestError::UnsupportedMutation),
    }
}

fn apply_env<'a>(
    cx: &Cx<'a>,
    env: &Table<'a>,
    entries: &Object<'a>,
) -> Result<(), ManifestError> {
    for (key, value) in entries.iter() {
        if let Value::Array(mutations) = value {
            // A list of mutations applies in order.
            for mutation in mutations.iter() {
                let Value::Object(mutation) = mutation else {
                    return Err(ManifestError::ExpectedObject);
                };
                apply_mutation_to_key(cx, env, key, &mutation)?;
            }
        } else {
            apply_value_to_key(cx, env, key, value)?;
        }
    }
    Ok(())
}

fn apply_value_to_key<'a>(
    cx: &Cx<'a>,
    env: &Table<'a>,
    key: &'a [u8],
    value: Value<'a>,
) -> Result<(), ManifestError> {
    // A { kind: "mutation", value: { ... } } wrapper routes to the mutation
    // decoder; everything else renders and inserts.
    if let Value::Object(object) = value {
        if object.get(b"kind").is_some_and(|kind| matches!(kind, Value::Str(b"mutation"))) {
            let inner = object.get(b"value").ok_or(ManifestError::MissingValue)?;
            let Value::Object(mutation) = inner else {
                return Err(ManifestError::ExpectedObject);
            };
            return apply_mutation_to_key(cx, env, key, &mutation);
        }
    }
    let rendered = render_value(cx, value)?;
    env.insert(key, rendered);
    Ok(())
}

fn apply_mutation_to_key<'a>(
    cx: &Cx<'a>,
    env: &Table<'a>,
    key: &'a [u8],
    mutation: &Object<'a>,
) -> Result<(), ManifestError> {
    match expect_kind(mutation)? {
        b"unset" => {
            env.remove(key);
            Ok(())
        }
        b"set" => {
            let value = mutation.get(b"value").ok_or(ManifestError::MissingValue)?;
            apply_value_to_key(cx, env, key, value)
        }
        // Both spellings appear in the wild.
        b"set_if_unset" | b"set-if-unset" => {
            if env.lookup(key).is_none() {
                let value = mutation.get(b"value").ok_or(ManifestError::MissingValue)?;
                apply_value_to_key(cx, env, key, value)?;
            }
            Ok(())
        }
        b"prepend" | b"append" => {
            let values = mutation.get(b"values").ok_or(ManifestError::MissingValue)?;
            let Value::Array(values) = values else {
                return Err(ManifestError::ExpectedArray);
            };
            let count = values.len();
            let parts = cx.arena().alloc_slice_fill_copy::<&[u8]>(count + 1, b"");
            for (n, value) in values.iter().enumerate() {
                let Value::Str(s) = value else {
                    return Err(ManifestError::ExpectedString);
                };
                parts[n] = s;
            }
            // The new values go in front; the existing value, when present,
            // stays at the tail.
            let used = match env.lookup(key) {
                Some(existing) => {
                    parts[count] = existing;
                    count + 1
                }
                None => count,
            };
            env.insert(key, join(cx.arena(), b":", &parts[..used]));
            Ok(())
        }
        b"prefix" => {
            let template = mutation.get(b"template").ok_or(ManifestError::MissingTemplate)?;
            let rendered = render_template(cx, template)?;
            let separator = mutation_separator(mutation)?;
            match env.lookup(key) {
                None => env.insert(key, rendered),
                Some(existing) => {
                    env.insert(key, join(cx.arena(), separator, &[rendered, existing]))
                }
            }
            Ok(())
        }
        b"suffix" => {
            let template = mutation.get(b"template").ok_or(ManifestError::MissingTemplate)?;
            let rendered = render_template(cx, template)?;
            let separator = mutation_separator(mutation)?;
            match env.lookup(key) {
                None => env.insert(key, rendered),
                Some(existing) => {
                    env.insert(key, join(cx.arena(), separator, &[existing, rendered]))
                }
            }
            Ok(())
        }
        b"merge" => Err(ManifestError::UnsupportedMutation),
        _ => Err(ManifestError::UnknownMutation),
    }
}

fn mutation_separator<'a>(mutation: &Object<'a>) -> Result<&'a [u8], ManifestError> {
    match mutation.get(b"separator") {
        None => Ok(b""),
        Some(Value::Str(separator)) => Ok(separator),
        Some(_) => Err(ManifestError::ExpectedString),
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Render a template object (`{ components: [...] }`) into a single arena
/// string. `string` components are literal; `artifact` components resolve
/// below the artifacts directory.
fn render_template<'a>(cx: &Cx<'a>, template: Value<'a>) -> Result<&'a [u8], ManifestError> {
    let Value::Object(object) = template else {
        return Err(ManifestError::ExpectedObject);
    };
    let components = object.get(b"components").ok_or(ManifestError::MissingComponents)?;
    let Value::Array(components) = components else {
        return Err(ManifestError::ExpectedArray);
    };

    // First pass: size the rendered string.
    let mut len = 0;
    for component in components.iter() {
        let (kind, value) = template_component(&component)?;
        len += match kind {
            b"string" => value.len(),
            b"artifact" => cx.artifacts_dir()?.len() + 1 + value.len(),
            _ => return Err(ManifestError::UnknownComponentKind),
        };
    }

    // Second pass: fill it.
    let rendered = cx.arena().alloc_slice_fill_copy(len, 0u8);
    let mut offset = 0;
    let mut put = |bytes: &[u8]| {
        rendered[offset..offset + bytes.len()].copy_from_slice(bytes);
        offset += bytes.len();
    };
    for component in components.iter() {
        let (kind, value) = template_component(&component)?;
        match kind {
            b"string" => put(value),
            b"artifact" => {
                put(cx.artifacts_dir()?);
                put(b"/");
                put(value);
            }
            _ => unreachable!(),
        }
    }
    Ok(rendered)
}

fn template_component<'a>(component: &Value<'a>) -> Result<(&'a [u8], &'a [u8]), ManifestError> {
    let Value::Object(object) = component else {
        return Err(ManifestError::ExpectedObject);
    };
    let kind = expect_kind(object)?;
    let value = object.get(b"value").ok_or(ManifestError::MissingValue)?;
    let Value::Str(value) = value else {
        return Err(ManifestError::ExpectedString);
    };
    Ok((kind, value))
}

/// Render an array of templates.
fn render_template_array<'a>(
    cx: &Cx<'a>,
    value: Value<'a>,
) -> Result<&'a [&'a [u8]], ManifestError> {
    let Value::Array(array) = value else {
        return Err(ManifestError::ExpectedArray);
    };
    let rendered = cx.arena().alloc_slice_fill_copy::<&[u8]>(array.len(), b"");
    for (n, template) in array.iter().enumerate() {
        rendered[n] = render_template(cx, template)?;
    }
    Ok(rendered)
}

/// Render a bare manifest value to a string for insertion into the
/// environment.
fn render_value<'a>(cx: &Cx<'a>, value: Value<'a>) -> Result<&'a [u8], ManifestError> {
    match value {
        Value::Null => Ok(b""),
        Value::Bool(true) => Ok(b"true"),
        Value::Bool(false) => Ok(b"false"),
        Value::Number(n) => Ok(int_to_bytes(cx.arena(), n)),
        Value::Str(s) => Ok(s),
        Value::Object(object) => {
            let kind = expect_kind(&object)?;
            let value = object.get(b"value").ok_or(ManifestError::MissingValue)?;
            match kind {
                b"object" => {
                    // An artifact ID; resolve it like an artifact component.
                    let Value::Str(id) = value else {
                        return Err(ManifestError::ExpectedString);
                    };
                    Ok(join(cx.arena(), b"/", &[cx.artifacts_dir()?, id]))
                }
                b"template" => render_template(cx, value),
                b"map" | b"bytes" | b"mutation" => Err(ManifestError::UnrenderableValue),
                _ => Err(ManifestError::UnknownValueKind),
            }
        }
        Value::Array(_) => Err(ManifestError::UnrenderableValue),
    }
}

struct BufOut {
    buf: [u8; 24],
    len: usize,
}

impl Out for BufOut {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }
}

fn int_to_bytes(arena: &Arena, value: i64) -> &[u8] {
    let mut out = BufOut {
        buf: [0; 24],
        len: 0,
    };
    put_dec(&mut out, value);
    arena.alloc_bytes(&out.buf[..out.len])
}

// ============================================================================
// Loader path derivation
// ============================================================================

/// After all user mutations: install `LD_LIBRARY_PATH`/`LD_PRELOAD` from the
/// manifest's path lists, stashing any prior values so the injection
/// library can undo the change in the child.
fn derive_loader_paths<'a>(cx: &Cx<'a>, manifest: &Manifest<'a>) -> Result<(), ManifestError> {
    let arena = cx.arena();
    let env = &manifest.env;

    if !manifest.library_paths.is_empty() {
        let rendered = join(arena, b":", manifest.library_paths);
        let value = match env.lookup(b"LD_LIBRARY_PATH") {
            Some(prior) => {
                env.insert(b"TANGRAM_RESTORE_LD_LIBRARY_PATH", prior);
                join(arena, b":", &[prior, rendered])
            }
            None => {
                env.insert(b"TANGRAM_CLEAR_LD_LIBRARY_PATH", b"true");
                rendered
            }
        };
        env.insert(b"LD_LIBRARY_PATH", value);
    }

    if !manifest.preloads.is_empty() {
        let rendered = join(arena, b":", manifest.preloads);
        let value = match env.lookup(b"LD_PRELOAD") {
            Some(prior) => {
                env.insert(b"TANGRAM_RESTORE_LD_PRELOAD", prior);
                join(arena, b":", &[prior, rendered])
            }
            None => rendered,
        };
        // The preload clear sentinel is installed regardless of a prior
        // value.
        env.insert(b"TANGRAM_CLEAR_LD_PRELOAD", b"true");
        env.insert(b"LD_PRELOAD", value);
    }

    Ok(())
}

// ============================================================================
// Diagnostics
// ============================================================================

impl Manifest<'_> {
    /// Human-readable dump used by `--tangram-print-manifest` and tracing.
    pub fn print<O: Out + ?Sized>(&self, out: &mut O) {
        if let Some(executable) = self.executable {
            out.put(b"executable: ");
            json::print_string(out, executable);
            out.put(b"\n");
        }
        if let Some(entrypoint) = self.entrypoint {
            out.put(b"entrypoint: ");
            put_hex(out, entrypoint);
            out.put(b"\n");
        }
        if let Some(interpreter) = self.interpreter {
            out.put(b"interpreter: ");
            json::print_string(out, interpreter);
            out.put(b" (");
            out.put(self.interpreter_kind.name().as_bytes());
            out.put(b")\n");
        }
        out.put(b"library_paths:\n");
        for path in self.library_paths {
            out.put(b"\t");
            out.put(path);
            out.put(b"\n");
        }
        out.put(b"preloads:\n");
        for path in self.preloads {
            out.put(b"\t");
            out.put(path);
            out.put(b"\n");
        }
        out.put(b"args:\n");
        for arg in self.argv {
            out.put(b"\t");
            out.put(arg);
            out.put(b"\n");
        }
        out.put(b"env:\n");
        for (key, value) in self.env.iter() {
            out.put(b"\t");
            out.put(key);
            out.put(b"=");
            out.put(value);
            out.put(b"\n");
        }
    }
}

// ============================================================================
// Artifact IDs
// ============================================================================

pub const ID_VERSION: u8 = 0;

/// Header of a content-addressed artifact name: a 4-byte prefix followed by
/// the algorithm-specific body.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id {
    pub version: u8,
    pub padding: u8,
    pub kind: u8,
    pub algorithm: u8,
}

impl Id {
    /// Split an encoded ID into its header and body.
    pub fn parse(bytes: &[u8]) -> Result<(Id, &[u8]), ManifestError> {
        if bytes.len() < 4 {
            return Err(ManifestError::InvalidId);
        }
        let id = Id {
            version: bytes[0],
            padding: bytes[1],
            kind: bytes[2],
            algorithm: bytes[3],
        };
        if id.version != ID_VERSION {
            return Err(ManifestError::InvalidId);
        }
        Ok((id, &bytes[4..]))
    }
}

// ============================================================================
// Tests
// ============================================================================

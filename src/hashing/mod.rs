//! Cache key derivation for cached functions
//!
//! Two keys address every cache entry:
//! - `function_key`: the function's module, qualified name, source text, captured
//!   values and the identities of the functions it depends on
//! - `value_key`: the arguments of one call
//!
//! Both are the first 32 hex characters of a SHA-256 digest. Values are
//! normalized into a [`Canonical`] tree with map keys sorted, so equal values
//! hash equally regardless of map iteration order. Floats are hashed by their
//! bits, so `NaN`, `inf`, `-inf` and `None` never share a key.

mod canonical;

use crate::error::HashingError;
use crate::logging::{operations, services};
use serde::Serialize;
use canonical::{to_canonical, Canonical};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const KEY_LEN: usize = 32;

/// Hashed in place of a dependency already on the current hashing path
const CYCLE_MARKER: &[u8] = b"memo-replay:dependency-cycle";

/// Arguments and captures whose names start with this prefix are never hashed
pub const UNHASHED_PREFIX: char = '_';

pub fn is_hash_exempt(name: &str) -> bool {
    name.starts_with(UNHASHED_PREFIX)
}

#[derive(Debug, Clone)]
enum Normalized {
    Value(Canonical),
    /// Name opts out of hashing
    Exempt,
    /// Process-local address, for values that cannot be serialized
    Identity(usize),
    Unhashable(String),
}

#[derive(Debug, Clone)]
enum Slot {
    Named(String),
    Positional(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Named(name) => write!(f, "{}", name),
            Slot::Positional(index) => write!(f, "#{}", index),
        }
    }
}

#[derive(Debug, Clone)]
struct HashInput {
    slot: Slot,
    type_name: &'static str,
    normalized: Normalized,
}

impl HashInput {
    fn of<T: Serialize + ?Sized>(slot: Slot, value: &T) -> Self {
        let exempt = matches!(&slot, Slot::Named(name) if is_hash_exempt(name));
        let normalized = if exempt {
            Normalized::Exempt
        } else {
            match to_canonical(value) {
                Ok(value) => Normalized::Value(value),
                Err(e) => Normalized::Unhashable(e.to_string()),
            }
        };
        Self {
            slot,
            type_name: std::any::type_name::<T>(),
            normalized,
        }
    }

    fn by_identity<T: ?Sized>(name: &str, value: &T) -> Self {
        Self {
            slot: Slot::Named(name.to_string()),
            type_name: std::any::type_name::<T>(),
            normalized: Normalized::Identity(value as *const T as *const () as usize),
        }
    }

    /// Feed this input into `hasher`. Returns `Ok(false)` when the input was skipped.
    fn update(&self, hasher: &mut Sha256, func_name: &str) -> Result<bool, HashingError> {
        match &self.normalized {
            Normalized::Exempt => Ok(false),
            Normalized::Unhashable(reason) => Err(HashingError {
                func_name: func_name.to_string(),
                arg_name: self.slot.to_string(),
                type_name: self.type_name.to_string(),
                reason: reason.clone(),
            }),
            Normalized::Value(value) => {
                update_slot(hasher, &self.slot);
                update_value(hasher, value);
                Ok(true)
            }
            Normalized::Identity(address) => {
                update_slot(hasher, &self.slot);
                update_tagged(hasher, b"identity", self.type_name.as_bytes());
                hasher.update(address.to_le_bytes());
                Ok(true)
            }
        }
    }
}

type DependencyResolver = Arc<dyn Fn() -> Vec<Arc<FuncIdentity>> + Send + Sync>;

/// What makes a cached function "the same function" across calls and restarts
///
/// Without [`source`](Self::source) the function key only covers the module and
/// qualified name, so edits to the body do not invalidate stored entries.
///
/// ```rust
/// use memo_replay::func_identity;
///
/// let scale = 3;
/// let identity = func_identity!(scaled, |n: i64| n * scale).capture("scale", &scale);
/// assert_eq!(identity.name(), "scaled");
/// ```
#[derive(Clone)]
pub struct FuncIdentity {
    module: String,
    qualname: String,
    source: Option<String>,
    captures: Vec<HashInput>,
    dependencies: Vec<DependencyResolver>,
}

impl FuncIdentity {
    pub fn new(module: impl Into<String>, qualname: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            qualname: qualname.into(),
            source: None,
            captures: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Source text of the function body
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// A value the body reads from its environment
    ///
    /// Values that fail to serialize are reported when the key is computed.
    pub fn capture<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        self.captures
            .push(HashInput::of(Slot::Named(name.to_string()), value));
        self
    }

    /// Functions called by the body
    ///
    /// Resolved lazily when the key is computed, so mutually dependent functions
    /// can refer to each other.
    pub fn depends_on<F>(mut self, resolve: F) -> Self
    where
        F: Fn() -> Vec<Arc<FuncIdentity>> + Send + Sync + 'static,
    {
        self.dependencies.push(Arc::new(resolve));
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    /// Last segment of the qualified name
    pub fn name(&self) -> &str {
        self.qualname
            .rsplit(|c: char| c == ':' || c == '.')
            .next()
            .unwrap_or(&self.qualname)
    }

    /// `module::qualname`, used in logs and errors
    pub fn display_name(&self) -> String {
        if self.module.is_empty() {
            self.qualname.clone()
        } else {
            format!("{}::{}", self.module, self.qualname)
        }
    }
}

impl fmt::Debug for FuncIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncIdentity")
            .field("module", &self.module)
            .field("qualname", &self.qualname)
            .field("has_source", &self.source.is_some())
            .field("captures", &self.captures.len())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

/// Build a [`FuncIdentity`] for the current module
///
/// `func_identity!(name)` identifies by module and name only.
/// `func_identity!(name, body...)` also hashes the stringified body tokens.
#[macro_export]
macro_rules! func_identity {
    ($name:ident) => {
        $crate::FuncIdentity::new(module_path!(), stringify!($name))
    };
    ($name:ident, $($body:tt)+) => {
        $crate::FuncIdentity::new(module_path!(), stringify!($name))
            .source(stringify!($($body)+))
    };
}

/// The hashed arguments of one call
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    inputs: Vec<HashInput>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A named argument. Names starting with `_` are excluded from the key.
    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        self.inputs
            .push(HashInput::of(Slot::Named(name.to_string()), value));
        self
    }

    /// An unnamed argument, keyed by its position among all arguments
    pub fn positional<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        let index = self.inputs.len();
        self.inputs.push(HashInput::of(Slot::Positional(index), value));
        self
    }

    /// Key an argument by its address instead of its contents
    ///
    /// Only stable for as long as the value stays where it is. Keys built this
    /// way never match across processes, so persisted entries for them are
    /// never reused.
    pub fn identity<T: ?Sized>(mut self, name: &str, value: &T) -> Self {
        if is_hash_exempt(name) {
            return self;
        }
        self.inputs.push(HashInput::by_identity(name, value));
        self
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Identity key of a cached function
pub fn make_function_key(identity: &FuncIdentity) -> Result<String, HashingError> {
    let mut hasher = Sha256::new();
    let mut on_path = HashSet::new();
    update_function(&mut hasher, identity, &mut on_path)?;

    let key = finish(hasher);
    debug!(
        service = services::DECORATOR,
        operation = operations::HASH,
        function = %identity.display_name(),
        function_key = %key,
        "computed function key"
    );
    Ok(key)
}

/// Key of one call's arguments within a function's namespace
///
/// A call without hashed arguments maps to a fixed key.
pub fn make_value_key(func_name: &str, args: &CallArgs) -> Result<String, HashingError> {
    let mut hasher = Sha256::new();
    for input in &args.inputs {
        if !input.update(&mut hasher, func_name)? {
            debug!(
                service = services::DECORATOR,
                operation = operations::HASH,
                function = %func_name,
                arg = %input.slot,
                "not hashing argument with leading underscore"
            );
        }
    }
    Ok(finish(hasher))
}

fn update_function(
    hasher: &mut Sha256,
    identity: &FuncIdentity,
    on_path: &mut HashSet<String>,
) -> Result<(), HashingError> {
    let display_name = identity.display_name();
    if !on_path.insert(display_name.clone()) {
        hasher.update(CYCLE_MARKER);
        return Ok(());
    }

    update_tagged(hasher, b"module", identity.module.as_bytes());
    update_tagged(hasher, b"qualname", identity.qualname.as_bytes());
    if let Some(source) = &identity.source {
        update_tagged(hasher, b"source", source.as_bytes());
    }

    for capture in &identity.captures {
        capture.update(hasher, &display_name)?;
    }

    for resolve in &identity.dependencies {
        for dependency in resolve() {
            update_function(hasher, &dependency, on_path)?;
        }
    }

    on_path.remove(&display_name);
    Ok(())
}

fn update_slot(hasher: &mut Sha256, slot: &Slot) {
    match slot {
        Slot::Named(name) => update_tagged(hasher, b"arg", name.as_bytes()),
        Slot::Positional(index) => {
            hasher.update(b"pos");
            hasher.update((*index as u64).to_le_bytes());
        }
    }
}

/// Tag and length prefix keep adjacent fields from running together
fn update_tagged(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn update_value(hasher: &mut Sha256, value: &Canonical) {
    match value {
        Canonical::Null => hasher.update(b"null"),
        Canonical::Bool(b) => {
            hasher.update(b"bool");
            hasher.update([*b as u8]);
        }
        Canonical::Int(n) => {
            hasher.update(b"int");
            hasher.update(n.to_le_bytes());
        }
        Canonical::UInt(n) => {
            hasher.update(b"uint");
            hasher.update(n.to_le_bytes());
        }
        Canonical::Float(bits) => {
            hasher.update(b"float");
            hasher.update(bits.to_le_bytes());
        }
        Canonical::Str(s) => update_tagged(hasher, b"str", s.as_bytes()),
        Canonical::Bytes(bytes) => update_tagged(hasher, b"bytes", bytes),
        Canonical::Seq(items) => {
            hasher.update(b"list");
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        // Entries are already sorted by key
        Canonical::Map(entries) => {
            hasher.update(b"map");
            hasher.update((entries.len() as u64).to_le_bytes());
            for (key, value) in entries {
                update_value(hasher, key);
                update_value(hasher, value);
            }
        }
    }
}

fn finish(hasher: Sha256) -> String {
    let mut key = hex::encode(hasher.finalize());
    key.truncate(KEY_LEN);
    key
}

/// Hash of already serialized JSON values, for keys built outside a call
pub(crate) fn hash_values<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut hasher = Sha256::new();
    for (name, value) in values {
        update_tagged(&mut hasher, b"arg", name.as_bytes());
        update_value(&mut hasher, &Canonical::from_json(value));
    }
    finish(hasher)
}

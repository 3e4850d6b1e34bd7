//! Operation sequences and content-addressed kernel identity
//!
//! A [`Program`] is a validated, ordered sequence of [`Operation`]s produced
//! by an external front-end. Each operation is annotated with whether it may
//! be captured into a batched dispatch and, for custom calls carrying device
//! code, a [`KernelKey`] derived from the payload bytes.
//!
//! Identity is content identity: two operations with byte-identical payloads
//! share a key and therefore share one compiled module. A key that does not
//! match its payload is rejected at construction time.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DespacharError, Result};

/// Number of bytes in a kernel content hash
pub const KEY_LEN: usize = 32;

/// Content hash identifying a kernel payload.
///
/// Derived with BLAKE3 over the raw payload bytes. Equality is full-hash
/// equality; there is no prefix or partial matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelKey([u8; KEY_LEN]);

impl KernelKey {
    /// Derive the key for a payload.
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex rendering of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(KEY_LEN * 2);
        for byte in &self.0 {
            write!(out, "{byte:02x}").expect("writing to a String cannot fail");
        }
        out
    }

    /// Parse a key from its 64-character hex rendering.
    ///
    /// # Errors
    ///
    /// Returns `Consistency` if the input is not exactly 64 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != KEY_LEN * 2 {
            return Err(DespacharError::Consistency {
                reason: format!("kernel key must be {} hex chars, got {}", KEY_LEN * 2, hex.len()),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_digit(chunk[0])?;
            let lo = hex_digit(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(DespacharError::Consistency {
            reason: format!("invalid hex character {:?} in kernel key", char::from(c)),
        }),
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for KernelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KernelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        KernelKey::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Kind of device work an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    /// A call into user-provided device code (carries a payload)
    CustomCall,
    /// A built-in device operation (no payload)
    BuiltIn,
}

/// One unit of device work in a program's execution sequence.
///
/// Constructed through [`Operation::custom_call`] or [`Operation::built_in`];
/// the ordinal `id` is assigned by [`Program::new`] from insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    id: usize,
    kind: OpKind,
    capturable: bool,
    cache_key: Option<KernelKey>,
    payload: Vec<u8>,
}

impl Operation {
    /// A custom call wrapping the given device-code payload.
    ///
    /// Custom calls are capturable by default and carry a cache key derived
    /// from the payload content.
    #[must_use]
    pub fn custom_call(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let cache_key = Some(KernelKey::of(&payload));
        Self {
            id: 0,
            kind: OpKind::CustomCall,
            capturable: true,
            cache_key,
            payload,
        }
    }

    /// A built-in device operation with no payload and no cache entry.
    #[must_use]
    pub fn built_in() -> Self {
        Self {
            id: 0,
            kind: OpKind::BuiltIn,
            capturable: true,
            cache_key: None,
            payload: Vec::new(),
        }
    }

    /// Override whether this operation may be captured into a batched
    /// dispatch.
    #[must_use]
    pub fn capturable(mut self, capturable: bool) -> Self {
        self.capturable = capturable;
        self
    }

    /// Assemble an operation from raw parts, bypassing key derivation.
    ///
    /// The parts are still validated by [`Program::new`]; a key that does not
    /// match the payload is a consistency error there. Intended for
    /// front-ends that transport precomputed hashes.
    #[must_use]
    pub fn from_parts(
        kind: OpKind,
        capturable: bool,
        cache_key: Option<KernelKey>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: 0,
            kind,
            capturable,
            cache_key,
            payload,
        }
    }

    /// Ordinal position within the owning program
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Kind tag
    #[must_use]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Whether this operation may be captured into a command buffer
    #[must_use]
    pub fn is_capturable(&self) -> bool {
        self.capturable
    }

    /// Content key, present iff this operation is backed by a cache entry
    #[must_use]
    pub fn cache_key(&self) -> Option<&KernelKey> {
        self.cache_key.as_ref()
    }

    /// True when this operation resolves a module through the cache
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cache_key.is_some()
    }

    /// Opaque device-code payload (empty for built-ins)
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A validated, ordered operation sequence ready for plan assembly.
#[derive(Debug, Clone)]
pub struct Program {
    ops: Vec<Operation>,
}

impl Program {
    /// Validate a sequence of operations and assign ordinal ids.
    ///
    /// # Errors
    ///
    /// Returns `Consistency` when:
    /// - a cache key is present on a built-in operation;
    /// - a custom call with a payload is missing its cache key;
    /// - a cache key does not match its payload's content hash;
    /// - two operations claim the same key with different payloads.
    pub fn new(mut ops: Vec<Operation>) -> Result<Self> {
        for (pos, op) in ops.iter_mut().enumerate() {
            op.id = pos;
        }

        let mut seen: std::collections::HashMap<&KernelKey, &[u8]> =
            std::collections::HashMap::new();
        for op in &ops {
            match (&op.kind, &op.cache_key) {
                (OpKind::BuiltIn, Some(_)) => {
                    return Err(DespacharError::Consistency {
                        reason: format!("operation {} is built-in but carries a cache key", op.id),
                    });
                }
                (OpKind::CustomCall, None) if !op.payload.is_empty() => {
                    return Err(DespacharError::Consistency {
                        reason: format!(
                            "operation {} is a custom call with a payload but no cache key",
                            op.id
                        ),
                    });
                }
                (OpKind::CustomCall, Some(key)) => {
                    let derived = KernelKey::of(&op.payload);
                    if *key != derived {
                        return Err(DespacharError::Consistency {
                            reason: format!(
                                "operation {} cache key does not match payload content",
                                op.id
                            ),
                        });
                    }
                    if let Some(prev) = seen.insert(key, op.payload.as_slice()) {
                        if prev != op.payload.as_slice() {
                            return Err(DespacharError::Consistency {
                                reason: format!(
                                    "key {key} claimed by operations with different payloads"
                                ),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Self { ops })
    }

    /// Operations in sequence order
    #[must_use]
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Number of operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when the program has no operations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<Operation> {
        self.ops
    }
}

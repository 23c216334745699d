use ahash::AHashMap;

use crate::{Word, errors::{CompileError, CompileErrorKind}};

/// Identifier of an interned string within one function image.
///
/// Ids are 1-based; the id 0 is reserved on the wire to mean "no string"
/// (the name slot of an anonymous function) and is never produced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub(crate) struct StringId(u32);

impl StringId {
    /// The id as a wire word.
    #[inline]
    pub fn word(self) -> Word {
        self.0 as Word
    }
}

/// Per-function string table.
///
/// Interns by value: equal strings return equal ids, in first-use order.
/// The serialized table is appended verbatim to the function's quartet
/// stream, so emission order fixes the ids the kernel sees.
#[derive(Debug, Default, Clone)]
pub(crate) struct StringTable {
    /// Maps strings to ids for deduplication during interning.
    index: AHashMap<String, StringId>,
    /// Interned strings, id order (id = index + 1).
    strings: Vec<String>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its 1-based id.
    ///
    /// One trailing NUL is stripped before interning (a convenience for
    /// callers passing C-terminated text); interior NULs cannot be
    /// represented in the table and fail with `BadString`.
    pub fn intern(&mut self, s: &str) -> Result<StringId, CompileError> {
        let s = s.strip_suffix('\0').unwrap_or(s);
        if s.contains('\0') {
            return Err(CompileError::spanless(
                CompileErrorKind::BadString,
                "strings cannot contain NUL bytes",
            ));
        }
        if let Some(id) = self.index.get(s) {
            return Ok(*id);
        }
        let id = StringId(u32::try_from(self.strings.len() + 1).expect("string table overflow"));
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), id);
        Ok(id)
    }

    /// Looks up a string by id.
    ///
    /// # Panics
    /// Panics if the id was not produced by this table.
    #[cfg(test)]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize - 1]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Appends the wire form of the table: strings in id order joined with
    /// single NUL separators, plus one final NUL. An empty table is a single
    /// NUL byte.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        for (i, s) in self.strings.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(s.as_bytes());
        }
        out.push(0);
    }
}

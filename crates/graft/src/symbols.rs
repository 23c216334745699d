use indexmap::IndexMap;

use crate::{
    Word, WORD_SIZE,
    errors::{CompileError, CompileErrorKind},
    parse::CodeRange,
};

/// Names that can never be variables, constants, or functions.
const RESERVED_KEYWORDS: [&str; 10] = [
    "word",
    "buffer",
    "array",
    "pointer",
    "ADDRESSOF",
    "VARIABLE_ARGUMENT",
    "ANONYMOUS",
    "STATIC",
    "new",
    "delete",
];

/// Names with this prefix denote kernel-resident callables.
pub(crate) const RESERVED_PREFIX: &str = "KERNEL";

/// The name of the sink variable that swallows expression-statement results.
pub(crate) const SINK_NAME: &str = "_";

pub(crate) fn is_reserved_keyword(name: &str) -> bool {
    RESERVED_KEYWORDS.contains(&name)
}

/// Checks a user-chosen function or constant name against the reserved
/// prefix, the reserved keywords, and the sink name.
pub(crate) fn validate_name(name: &str, position: CodeRange) -> Result<(), CompileError> {
    if name.starts_with(RESERVED_PREFIX) || is_reserved_keyword(name) || name == SINK_NAME {
        return Err(CompileError::reserved_name(name, position));
    }
    Ok(())
}

/// The kind of a declared variable.
///
/// `Undef` is internal: arguments carry it until their first use or an
/// explicit declaration fixes the kind, and it is emitted as `Word`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VarKind {
    Undef,
    Word,
    Buffer,
    Array,
    Pointer,
}

impl VarKind {
    /// The wire code of this kind. `Undef` never reaches the wire as itself.
    pub(crate) fn code(self) -> Word {
        match self {
            Self::Undef | Self::Word => 0,
            Self::Buffer => 1,
            Self::Array => 2,
            Self::Pointer => 3,
        }
    }

    pub(crate) fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "word" => Some(Self::Word),
            "pointer" => Some(Self::Pointer),
            "buffer" => Some(Self::Buffer),
            "array" => Some(Self::Array),
            _ => None,
        }
    }

    /// Buffers and arrays name storage, not a value slot: they cannot be
    /// assigned to and their bare reference lowers to an address.
    pub(crate) fn is_buffer_like(self) -> bool {
        matches!(self, Self::Buffer | Self::Array)
    }
}

/// Dense 1-based variable id within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct VarId(u32);

impl VarId {
    /// The id as a wire word.
    #[inline]
    pub fn word(self) -> Word {
        self.0 as Word
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One variable or argument entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VarEntry {
    pub id: VarId,
    pub kind: VarKind,
    pub size: Word,
    pub init: Word,
    pub flags: Word,
}

/// Per-function variable and argument table.
///
/// Ids are the insertion index plus one, so they are dense and 1-based by
/// construction; arguments are inserted first and occupy ids
/// `1..=max_args`. Promotion of an `Undef` entry rewrites its kind, size,
/// init, and flags but never its id.
#[derive(Debug, Clone, Default)]
pub(crate) struct SymbolTable {
    entries: IndexMap<String, VarEntry>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Non-promoting lookup (subscript lowering reads the raw kind).
    pub fn get(&self, name: &str) -> Option<VarEntry> {
        self.entries.get(name).copied()
    }

    /// Entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Appends an argument entry of kind `Undef`.
    pub fn add_argument(&mut self, name: &str, init: Word, position: CodeRange) -> Result<(), CompileError> {
        if self.entries.contains_key(name) {
            return Err(CompileError::new(
                CompileErrorKind::BadDeclaration,
                format!("duplicate argument `{name}`"),
                position,
            ));
        }
        let id = self.next_id();
        self.entries.insert(
            name.to_owned(),
            VarEntry {
                id,
                kind: VarKind::Undef,
                size: WORD_SIZE,
                init,
                flags: 0,
            },
        );
        Ok(())
    }

    /// Resolves an existing variable, promoting an `Undef` entry to `Word`.
    ///
    /// Fails with `UseBeforeAssignment` if the name was never created.
    pub fn resolve(&mut self, name: &str, position: CodeRange) -> Result<VarEntry, CompileError> {
        if !self.entries.contains_key(name) {
            return Err(CompileError::use_before_assignment(name, position));
        }
        Ok(self.promote(name, VarKind::Word, WORD_SIZE, 0, 0))
    }

    /// Resolves a variable, creating a default `Word` entry if absent
    /// (assignment targets and the sink).
    pub fn touch(&mut self, name: &str, position: CodeRange) -> Result<VarEntry, CompileError> {
        self.ensure(name, VarKind::Word, WORD_SIZE, 0, 0, false, position)
    }

    /// Creates a variable of an explicit kind, or promotes an `Undef`
    /// argument in place. An existing entry of a concrete kind is returned
    /// unchanged.
    pub fn declare(
        &mut self,
        name: &str,
        kind: VarKind,
        size: Word,
        init: Word,
        flags: Word,
        position: CodeRange,
    ) -> Result<VarEntry, CompileError> {
        self.ensure(name, kind, size, init, flags, true, position)
    }

    fn ensure(
        &mut self,
        name: &str,
        kind: VarKind,
        size: Word,
        init: Word,
        flags: Word,
        explicit: bool,
        position: CodeRange,
    ) -> Result<VarEntry, CompileError> {
        if !self.entries.contains_key(name) {
            self.check_creatable(name, explicit, position)?;
            let id = self.next_id();
            self.entries.insert(
                name.to_owned(),
                VarEntry {
                    id,
                    kind,
                    size,
                    init,
                    flags,
                },
            );
            return Ok(self.entries[name]);
        }
        Ok(self.promote(name, kind, size, init, flags))
    }

    /// Rewrites an `Undef` entry with concrete attributes, preserving its id.
    /// Entries of a concrete kind are left untouched.
    fn promote(&mut self, name: &str, kind: VarKind, size: Word, init: Word, flags: Word) -> VarEntry {
        let entry = self.entries.get_mut(name).expect("promote of unknown variable");
        if entry.kind == VarKind::Undef {
            entry.kind = kind;
            entry.size = size;
            entry.init = init;
            entry.flags = flags;
        }
        *entry
    }

    fn check_creatable(&self, name: &str, explicit: bool, position: CodeRange) -> Result<(), CompileError> {
        // Compiler temporaries use a dotted prefix no source identifier can
        // carry, so they are exempt from every check.
        if name.starts_with('.') {
            return Ok(());
        }
        if is_reserved_keyword(name) || name.starts_with(RESERVED_PREFIX) {
            return Err(CompileError::reserved_name(name, position));
        }
        if explicit && name == SINK_NAME {
            return Err(CompileError::reserved_name(name, position));
        }
        Ok(())
    }

    fn next_id(&self) -> VarId {
        VarId(u32::try_from(self.entries.len() + 1).expect("variable id overflow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> CodeRange {
        CodeRange::default()
    }

    #[test]
    fn ids_are_dense_and_one_based() {
        let mut table = SymbolTable::new();
        table.add_argument("a", 0, pos()).unwrap();
        table.add_argument("b", 5, pos()).unwrap();
        table.touch("x", pos()).unwrap();
        let ids: Vec<usize> = table.iter().map(|(_, e)| e.id.index()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn resolve_promotes_undef_argument_to_word() {
        let mut table = SymbolTable::new();
        table.add_argument("a", 0, pos()).unwrap();
        assert_eq!(table.get("a").unwrap().kind, VarKind::Undef);
        let entry = table.resolve("a", pos()).unwrap();
        assert_eq!(entry.kind, VarKind::Word);
        assert_eq!(entry.id.index(), 1);
    }

    #[test]
    fn declare_promotes_undef_preserving_id() {
        let mut table = SymbolTable::new();
        table.add_argument("p", 0, pos()).unwrap();
        let entry = table.declare("p", VarKind::Pointer, WORD_SIZE, 0, 0, pos()).unwrap();
        assert_eq!(entry.kind, VarKind::Pointer);
        assert_eq!(entry.id.index(), 1);
    }

    #[test]
    fn declare_leaves_concrete_kind_unchanged() {
        let mut table = SymbolTable::new();
        table.declare("b", VarKind::Buffer, 16, 0, 0, pos()).unwrap();
        let entry = table.declare("b", VarKind::Word, WORD_SIZE, 0, 0, pos()).unwrap();
        assert_eq!(entry.kind, VarKind::Buffer);
        assert_eq!(entry.size, 16);
    }

    #[test]
    fn resolve_unknown_fails() {
        let mut table = SymbolTable::new();
        let err = table.resolve("ghost", pos()).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UseBeforeAssignment);
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut table = SymbolTable::new();
        assert!(table.touch("word", pos()).is_err());
        assert!(table.touch("KERNEL_printk", pos()).is_err());
        assert!(table.declare("_", VarKind::Word, WORD_SIZE, 0, 0, pos()).is_err());
        // ... but the sink is creatable implicitly, and temporaries always.
        assert!(table.touch("_", pos()).is_ok());
        assert!(table.touch(".tmp0", pos()).is_ok());
    }
}

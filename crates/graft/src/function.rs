use std::collections::BTreeMap;

use crate::{
    Word, WORD_SIZE,
    bytecode::{
        builder::{PendingOp, resolve_blocks},
        compiler::LoadedHelper,
        op::{FuncFlags, Quartet},
    },
    errors::CompileError,
    intern::StringTable,
    parse::CodeRange,
    symbols::{self, SymbolTable},
};

/// A compiled function, sealed by the lowerer and ready to be built into a
/// loadable image.
///
/// A `Function` is immutable from the outside; the session builds its image
/// and owns its lifetime once loaded. Format helpers synthesized for this
/// function hang off it (keyed by arity) and are unloaded with it.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    /// Type flags baked in at definition time (`VARIABLE_ARGUMENT` marker).
    pub(crate) function_type: FuncFlags,
    /// Identified to the kernel by address, not name.
    pub(crate) anonymous: bool,
    /// Compiled and loaded, but not handed back to the caller.
    pub(crate) is_static: bool,
    pub(crate) min_args: usize,
    pub(crate) max_args: usize,
    pub(crate) symbols: SymbolTable,
    pub(crate) strings: StringTable,
    /// The lowered outermost flow frame.
    pub(crate) body: Vec<PendingOp>,
    /// Format helpers owned by this function, keyed by arity.
    pub(crate) helpers: BTreeMap<usize, LoadedHelper>,
}

impl Function {
    pub(crate) fn new(name: &str, position: CodeRange) -> Result<Self, CompileError> {
        symbols::validate_name(name, position)?;
        Ok(Self {
            name: name.to_owned(),
            function_type: FuncFlags::empty(),
            anonymous: false,
            is_static: false,
            min_args: 0,
            max_args: 0,
            symbols: SymbolTable::new(),
            strings: StringTable::new(),
            body: Vec::new(),
            helpers: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Builds the loadable image: function header quartet, one variable
    /// quartet per entry in id order, the offset-resolved body, then the
    /// string table.
    ///
    /// With `unhandled_return = None` the function re-raises unhandled
    /// exceptions as its return value; otherwise it returns the given word.
    /// The same function builds byte-identical images on every call.
    ///
    /// # Panics
    /// Panics if the symbol table's ids are not dense and 1-based, which
    /// the table guarantees by construction.
    pub(crate) fn build_image(
        &mut self,
        unhandled_return: Option<Word>,
        extra_flags: FuncFlags,
    ) -> Result<Vec<u8>, CompileError> {
        let (return_exception_value, error_return) = match unhandled_return {
            None => (true, 0),
            Some(value) => (false, value),
        };
        // Anonymous functions have no name on the wire; named functions
        // intern theirs after every body string, so ids stay stable across
        // rebuilds.
        let name_id = if self.anonymous {
            0
        } else {
            self.strings.intern(&self.name)?.word()
        };

        let mut preamble = Vec::with_capacity(1 + self.symbols.len());
        preamble.push(Quartet::function(
            self.min_args as Word,
            return_exception_value,
            name_id,
            error_return,
            self.function_type | extra_flags,
        ));
        for (slot, (_, entry)) in self.symbols.iter().enumerate() {
            assert_eq!(entry.id.index(), slot + 1, "variable ids must be dense and 1-based");
            preamble.push(Quartet::variable(
                entry.kind,
                slot < self.max_args,
                entry.size,
                entry.init,
                entry.flags,
            ));
        }

        let quartets = resolve_blocks(preamble, self.body.clone());
        let mut image = Vec::with_capacity(quartets.len() * 4 * WORD_SIZE);
        for quartet in &quartets {
            quartet.write_le(&mut image);
        }
        self.strings.serialize_into(&mut image);
        Ok(image)
    }
}

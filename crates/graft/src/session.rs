//! Sessions and the loaded-function registry.
//!
//! A session owns a device handle and the lifetime of everything loaded
//! through it. Non-global sessions lean on the kernel: closing the handle
//! frees their functions. Global sessions share a kernel-wide namespace and
//! must unload explicitly; `close` walks the registry and does so.

use std::fmt;

use indexmap::IndexMap;

use crate::{
    Word,
    bytecode::{
        compiler::{self, HelperHost, LoadedHelper},
        op::FuncFlags,
    },
    device::{CallArg, DeviceChannel, ExceptionRecord, KernelDevice, Transport},
    errors::GraftError,
    function::Function,
    tracer::Tracer,
};

/// Client-side session misuse, caught before any device traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The handle does not belong to this session (or was unloaded).
    NotOwned,
    /// An anonymous operation needs a kernel address, but the load reply
    /// carried none.
    MissingAddress,
    /// The session was closed.
    Closed,
    /// The session reached a state it cannot act on.
    InvalidState(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOwned => write!(f, "this function does not belong to this session"),
            Self::MissingAddress => write!(f, "the kernel returned no address for an anonymous function"),
            Self::Closed => write!(f, "the session is closed"),
            Self::InvalidState(msg) => write!(f, "invalid session state: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Opaque handle to a function loaded in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(u64);

/// One registry entry: the function, its kernel address (from the load
/// reply), and the handles of the format helpers it owns.
#[derive(Debug)]
struct Registered {
    function: Function,
    address: Option<Word>,
    helpers: Vec<FunctionHandle>,
}

/// A handle to the kernel device plus the registry of functions loaded
/// through it.
pub struct Session<D: DeviceChannel = KernelDevice> {
    transport: Transport<D>,
    global: bool,
    functions: IndexMap<u64, Registered>,
    next_handle: u64,
    closed: bool,
}

impl Session<KernelDevice> {
    /// Opens the default device node. A global session loads into the
    /// kernel-wide namespace and must unload everything before closing.
    pub fn open(global: bool) -> Result<Self, GraftError> {
        Ok(Self::with_channel(KernelDevice::open()?, global))
    }

    /// Opens a session on a non-default device node.
    pub fn open_at(path: impl AsRef<std::path::Path>, global: bool) -> Result<Self, GraftError> {
        Ok(Self::with_channel(KernelDevice::open_path(path)?, global))
    }
}

impl<D: DeviceChannel> Session<D> {
    /// Builds a session over an arbitrary device channel.
    pub fn with_channel(channel: D, global: bool) -> Self {
        Self {
            transport: Transport::new(channel),
            global,
            functions: IndexMap::new(),
            next_handle: 1,
            closed: false,
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.transport.set_tracer(tracer);
    }

    /// Compiles a module and loads every function it defines, static ones
    /// included. Returns the handles of the non-static functions, in
    /// definition order.
    ///
    /// Compilation finishes before the first load, so a compiler error
    /// leaves the session unchanged. Format-string lowering is the one
    /// exception: its helper functions load while their owner is still
    /// compiling, because the owner embeds their kernel addresses.
    pub fn compile(&mut self, source: &str) -> Result<Vec<FunctionHandle>, GraftError> {
        self.ensure_open()?;
        let functions = compiler::compile_source(source, self)?;
        self.transport.tracer_mut().on_compile(functions.len());
        let mut handles = Vec::new();
        for function in functions {
            let is_static = function.is_static();
            let handle = self.load(function, None, FuncFlags::empty())?;
            if !is_static {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Builds a function's image and loads it.
    ///
    /// With `unhandled_return = None` the function re-raises unhandled
    /// exceptions as its return value; `Some(word)` makes it return that
    /// word instead. `extra_flags` are OR-ed into the function-type word.
    ///
    /// A kernel refusal leaves the function unregistered.
    pub fn load(
        &mut self,
        mut function: Function,
        unhandled_return: Option<Word>,
        extra_flags: FuncFlags,
    ) -> Result<FunctionHandle, GraftError> {
        self.ensure_open()?;
        let image = function.build_image(unhandled_return, extra_flags)?;
        let name = if function.is_anonymous() { None } else { Some(function.name()) };
        self.transport.tracer_mut().on_load(name, image.len());
        let address = self.transport.load(&image, self.global)?;
        let handle = FunctionHandle(self.next_handle);
        self.next_handle += 1;
        let helpers = function.helpers.values().map(|h| h.handle).collect();
        self.functions.insert(
            handle.0,
            Registered {
                function,
                address,
                helpers,
            },
        );
        Ok(handle)
    }

    /// Executes a loaded function and returns the reply's value word
    /// (`None` for an empty reply body).
    ///
    /// A kernel refusal also fetches the in-kernel exception record, which
    /// stays readable through [`Session::last_exception`].
    pub fn execute(&mut self, handle: FunctionHandle, args: &[CallArg]) -> Result<Option<Word>, GraftError> {
        self.ensure_open()?;
        let entry = self.functions.get(&handle.0).ok_or(SessionError::NotOwned)?;
        if entry.function.is_anonymous() {
            let address = entry.address.ok_or(SessionError::MissingAddress)?;
            self.transport.tracer_mut().on_execute(None, args.len());
            self.transport.execute_anonymous(address, args, self.global)
        } else {
            let name = entry.function.name().to_owned();
            self.transport.tracer_mut().on_execute(Some(&name), args.len());
            self.transport.execute_named(&name, args, self.global)
        }
    }

    /// Unloads a function and the format helpers it owns.
    ///
    /// The registry entries are removed even when the device refuses -- a
    /// failed unload must not leave a stuck handle -- and the first device
    /// error is reported after all removals.
    pub fn unload(&mut self, handle: FunctionHandle) -> Result<(), GraftError> {
        self.ensure_open()?;
        let entry = self.functions.shift_remove(&handle.0).ok_or(SessionError::NotOwned)?;
        let mut first_error = None;
        for helper in entry.helpers {
            if self.functions.contains_key(&helper.0)
                && let Err(error) = self.unload(helper)
                && first_error.is_none()
            {
                first_error = Some(error);
            }
        }
        let name = if entry.function.is_anonymous() { None } else { Some(entry.function.name().to_owned()) };
        self.transport.tracer_mut().on_unload(name.as_deref());
        let result = match (&name, entry.address) {
            (Some(name), _) => self.transport.unload_named(name, self.global).map(|_| ()),
            (None, Some(address)) => self.transport.unload_anonymous(address, self.global).map(|_| ()),
            (None, None) => Err(SessionError::MissingAddress.into()),
        };
        if let Err(error) = result
            && first_error.is_none()
        {
            first_error = Some(error);
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// The kernel address assigned to a loaded function, when known.
    #[must_use]
    pub fn address_of(&self, handle: FunctionHandle) -> Option<Word> {
        self.functions.get(&handle.0).and_then(|entry| entry.address)
    }

    /// The loaded function behind a handle.
    #[must_use]
    pub fn function(&self, handle: FunctionHandle) -> Option<&Function> {
        self.functions.get(&handle.0).map(|entry| &entry.function)
    }

    /// The exception record fetched after the most recent failed execute.
    #[must_use]
    pub fn last_exception(&self) -> Option<ExceptionRecord> {
        self.transport.last_exception()
    }

    /// Closes the session.
    ///
    /// A global session unloads every remaining function first (its loads
    /// outlive the device handle); a non-global session only drops its
    /// registry, since closing the handle frees its functions kernel-side.
    /// The first unload error is reported after the sweep completes.
    pub fn close(&mut self) -> Result<(), GraftError> {
        if self.closed {
            return Ok(());
        }
        let mut first_error = None;
        if self.global {
            while let Some(key) = self.functions.keys().next().copied() {
                if let Err(error) = self.unload(FunctionHandle(key))
                    && first_error.is_none()
                {
                    first_error = Some(error);
                }
            }
        } else {
            self.functions.clear();
        }
        self.closed = true;
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

impl<D: DeviceChannel> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

impl<D: DeviceChannel> HelperHost for Session<D> {
    /// Compiles and loads the `arity`-parameter format helper through this
    /// session. The helper is anonymous; its load reply carries the address
    /// the call site embeds.
    fn synthesize_format_helper(&mut self, arity: usize) -> Result<LoadedHelper, GraftError> {
        let source = format_helper_source(arity);
        let mut handles = self.compile(&source)?;
        let handle = handles.pop().ok_or_else(|| {
            SessionError::InvalidState("the format helper compiled to no function".to_owned())
        })?;
        let address = self.address_of(handle).ok_or(SessionError::MissingAddress)?;
        Ok(LoadedHelper { handle, address })
    }
}

/// The format helper: sizes the output with a zero-length formatted print,
/// allocates, formats into the allocation, and returns it. The raised code
/// on a size mismatch is `WrongParameter`.
fn format_helper_source(arity: usize) -> String {
    let args = (0..arity).map(|i| format!("arg{i}")).collect::<Vec<_>>().join(", ");
    format!(
        r#"
VARIABLE_ARGUMENT("KERNEL_snprintf")

ANONYMOUS("format_helper")
ERROR_PARAM = 5

def format_helper({args}):
    length = KERNEL_snprintf(0, 0, {args})
    buf = new(length + 1)
    if KERNEL_snprintf(buf, length + 1, {args}) != length:
        raise ERROR_PARAM
    return buf
"#
    )
}

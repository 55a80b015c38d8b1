use std::any::Any;
use std::fmt;
use std::rc::Rc;

use serde_json::{json, Value};

use crate::ddoc::NodeRef;
use crate::error::ViewServerError;
use crate::mime::MimeProvider;
use crate::render::RenderScratch;
use crate::stream::SharedIo;
use crate::version::ProtocolVersion;

pub mod rhai;

pub use self::rhai::RhaiEvaluator;

/// Compiled user function.
///
/// The engine stores and passes these around without inspecting them; only
/// the evaluator that produced one can call it.
#[derive(Clone)]
pub struct FunctionHandle(Rc<dyn Any>);

impl FunctionHandle {
    pub fn new<T: 'static>(inner: T) -> Self {
        FunctionHandle(Rc::new(inner))
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FunctionHandle(..)")
    }
}

/// Compiled `require` module, memoized inside the design-document tree.
#[derive(Clone)]
pub struct ModuleHandle(Rc<dyn Any>);

impl ModuleHandle {
    pub fn new<T: 'static>(inner: T) -> Self {
        ModuleHandle(Rc::new(inner))
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModuleHandle(..)")
    }
}

/// A render provider registered through the `provides` capability.
#[derive(Clone)]
pub struct ProviderHandle(Rc<dyn Any>);

impl ProviderHandle {
    pub fn new<T: 'static>(inner: T) -> Self {
        ProviderHandle(Rc::new(inner))
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderHandle(..)")
    }
}

/// How a user-function invocation failed.
///
/// The handlers map these into the wire taxonomy differently per command:
/// map wraps natives under their error name, render wraps them as
/// `render_error`, and validate converts assertions to `Forbidden`.
#[derive(Debug)]
pub enum CallError {
    /// User code raised one of the wire-protocol errors directly.
    Protocol(ViewServerError),
    /// A failed assertion.
    Assertion(String),
    /// Anything else the evaluator surfaced, with a short error-kind name.
    Native { name: String, message: String },
}

impl CallError {
    pub fn name(&self) -> &str {
        match self {
            CallError::Protocol(_) => "Error",
            CallError::Assertion(_) => "AssertionError",
            CallError::Native { name, .. } => name,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CallError::Protocol(err) => err.to_string(),
            CallError::Assertion(message) => message.clone(),
            CallError::Native { message, .. } => message.clone(),
        }
    }

    /// Collapses into the wire taxonomy the way the main loop would: protocol
    /// errors pass through untouched, anything else terminates the engine.
    pub fn into_protocol(self) -> ViewServerError {
        match self {
            CallError::Protocol(err) => err,
            other => {
                let name = other.name().to_string();
                ViewServerError::unexpected(name, other.message())
            }
        }
    }
}

/// Compile-and-run facility for user-supplied function sources.
///
/// The engine treats compiled handles as opaque tokens. Capability hooks
/// (`log`, `emit`, `send`, `get_row`, `provides`, ...) reach the engine
/// through the [`CallContext`] the evaluator was built with, so calls need no
/// extra plumbing at the call site.
pub trait Evaluator {
    /// Compiles `source` to a callable handle.
    ///
    /// Exactly one top-level function must be defined. When `ddoc` is given,
    /// the compiled function can `require` modules out of that tree.
    fn compile(
        &self,
        source: &str,
        ddoc: Option<NodeRef>,
    ) -> Result<FunctionHandle, ViewServerError>;

    /// Number of parameters the compiled function declares.
    fn arity(&self, func: &FunctionHandle) -> usize;

    /// Invokes a compiled function.
    fn call(&self, func: &FunctionHandle, args: &[Value]) -> Result<Value, CallError>;

    /// Invokes a registered render provider (a 0-ary callable).
    fn call_provider(&self, provider: &ProviderHandle) -> Result<Value, CallError>;
}

/// Scratch state shared between the engine and the evaluator's capability
/// hooks for the duration of one command.
pub struct CallContext {
    pub version: ProtocolVersion,
    pub io: SharedIo,
    pub render: RenderScratch,
    pub mime: MimeProvider,
    /// `[key, value]` pairs collected from `emit` during a map call.
    pub emitted: Vec<Value>,
}

impl CallContext {
    pub fn new(version: ProtocolVersion, io: SharedIo) -> Self {
        CallContext {
            version,
            io,
            render: RenderScratch::default(),
            mime: MimeProvider::default(),
            emitted: Vec::new(),
        }
    }

    /// The `log` capability: forwards a message to the host as a log frame.
    ///
    /// Non-string payloads are JSON-encoded. Versions before 0.11.0 emit
    /// `{"log": msg}` and turn a null payload into a fixed complaint; later
    /// versions emit `["log", msg]`.
    pub fn log(&self, message: Value) -> Result<(), ViewServerError> {
        let array_shaped = self.version.array_envelopes();
        let text = match message {
            Value::String(text) => text,
            Value::Null if !array_shaped => {
                "Error: attempting to log message of None".to_string()
            }
            other => other.to_string(),
        };
        let frame = if array_shaped {
            json!(["log", text])
        } else {
            json!({ "log": text })
        };
        self.io.borrow_mut().write_frame(&frame)
    }
}

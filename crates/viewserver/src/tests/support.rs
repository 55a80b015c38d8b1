use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use serde_json::Value;

use crate::eval::{CallContext, RhaiEvaluator};
use crate::server::{QueryServer, ServerConfig};
use crate::stream::{LineStream, SharedIo};
use crate::version::ProtocolVersion;

pub(super) type MemoryStream = LineStream<Cursor<Vec<u8>>, Vec<u8>>;

/// In-memory frame stream preloaded with `frames` as input lines.
///
/// Returns both the concrete handle (to inspect output afterwards) and the
/// type-erased handle the engine consumes.
pub(super) fn memory_io(frames: &[Value]) -> (Rc<RefCell<MemoryStream>>, SharedIo) {
    let mut input = String::new();
    for frame in frames {
        input.push_str(&frame.to_string());
        input.push('\n');
    }
    memory_io_raw(&input)
}

pub(super) fn memory_io_raw(input: &str) -> (Rc<RefCell<MemoryStream>>, SharedIo) {
    let typed = Rc::new(RefCell::new(LineStream::new(
        Cursor::new(input.as_bytes().to_vec()),
        Vec::new(),
    )));
    let shared: SharedIo = typed.clone();
    (typed, shared)
}

/// Decodes everything the engine wrote, one frame per line.
pub(super) fn output_frames(stream: &Rc<RefCell<MemoryStream>>) -> Vec<Value> {
    stream
        .borrow()
        .writer()
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).expect("output frame is valid JSON"))
        .collect()
}

pub(super) fn proto(version: &str) -> ProtocolVersion {
    version.parse().expect("valid protocol version")
}

/// Drives a full server over in-memory streams: returns the exit code and
/// every output frame.
pub(super) fn run_server(version: &str, frames: &[Value]) -> (i32, Vec<Value>) {
    run_server_with_config(version, ServerConfig::default(), frames)
}

pub(super) fn run_server_with_config(
    version: &str,
    config: ServerConfig,
    frames: &[Value],
) -> (i32, Vec<Value>) {
    let (typed, shared) = memory_io(frames);
    let mut server = QueryServer::new(proto(version), shared).with_config(config);
    let code = server.serve();
    (code, output_frames(&typed))
}

/// An evaluator wired to a throwaway context, for tests below the server
/// level. `frames` preloads the input side so list functions can pull rows.
pub(super) fn evaluator_with_input(
    version: &str,
    frames: &[Value],
) -> (
    RhaiEvaluator,
    Rc<RefCell<CallContext>>,
    Rc<RefCell<MemoryStream>>,
) {
    let (typed, shared) = memory_io(frames);
    let version = proto(version);
    let ctx = Rc::new(RefCell::new(CallContext::new(version.clone(), shared)));
    let evaluator = RhaiEvaluator::new(&version, ctx.clone());
    (evaluator, ctx, typed)
}

pub(super) fn evaluator(
    version: &str,
) -> (
    RhaiEvaluator,
    Rc<RefCell<CallContext>>,
    Rc<RefCell<MemoryStream>>,
) {
    evaluator_with_input(version, &[])
}

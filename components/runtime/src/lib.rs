//! Runtime layer of the AeroJS execution core: objects and hidden-class
//! shapes, lexical environments and call frames, inline-cache sites, the
//! bytecode interpreter the JIT tiers fall back to, promise/event-loop
//! plumbing, and the embedder-facing context API.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod call_frame;
mod context;
mod event_loop;
mod inline_cache;
mod interp;
mod object;
mod profile;

pub use call_frame::{CallFrame, EnvArena, Environment, FrameKind, FrameState};
pub use context::{Context, ContextOptions, ModuleHook, ParserHook};
pub use event_loop::{EventLoop, Microtask, PromiseId, PromiseState, PromiseTable};
pub use inline_cache::{
    CacheKey, IcEntry, IcSite, IcSiteTable, IcState, POLYMORPHIC_CAPACITY,
};
pub use interp::{Exception, Interpreter, NativeFunction, PrimitiveHint, Realm};
pub use object::{
    EnvId, JsObject, ObjectHeap, ObjectKind, Shape, ShapeId, ShapeRegistry,
};
pub use profile::{
    BytecodeAddress, InstalledTrace, Profiler, SideExitKind, TraceRuntime,
};

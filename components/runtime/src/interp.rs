//! Realm state and the bytecode interpreter.
//!
//! The interpreter is the tier every compiled tier falls back to. It
//! drives call frames, inline caches, hotness counters and the trace
//! dispatch seam, and honors each block's exception table when unwinding.
//! Within one realm, execution is single-threaded and cooperative;
//! observable side effects happen in bytecode order.

use crate::call_frame::{CallFrame, EnvArena};
use crate::inline_cache::{CacheKey, IcEntry, IcSiteTable};
use crate::object::{EnvId, JsObject, ObjectHeap, ObjectKind, ShapeRegistry};
use crate::profile::{BytecodeAddress, Profiler, SideExitKind, TraceRuntime};
use bytecode_system::{Constant, DecodedInstruction, IcSiteKind, Opcode};
use core_types::{
    ErrorKind, Heap, JsBigInt, JsError, ObjectId, StringId, Value,
};
use frontend::LoweredProgram;
use std::collections::HashMap;
use std::sync::Arc;

/// An in-flight exception: the thrown value, plus the engine error that
/// produced it when the throw came from the engine rather than user code.
#[derive(Debug, Clone)]
pub struct Exception {
    /// The value visible to `catch`
    pub value: Value,
    /// The originating engine error, if any
    pub error: Option<JsError>,
}

/// Signature of a host-native function.
pub type NativeFunction =
    fn(&mut Interpreter<'_>, Value, &[Value]) -> Result<Value, JsError>;

/// Per-context mutable engine state: the primitive heap, objects, shapes,
/// environments, inline caches and profiling counters.
pub struct Realm {
    /// Primitive heap (strings, symbols, BigInts)
    pub heap: Heap,
    /// Object storage
    pub objects: ObjectHeap,
    /// Hidden-class registry
    pub shapes: ShapeRegistry,
    /// Lexical environments
    pub envs: EnvArena,
    /// Inline-cache sites
    pub ic_sites: IcSiteTable,
    /// Execution statistics
    pub profiler: Profiler,
    /// Name-keyed globals (host bindings and implicit globals)
    pub globals: HashMap<StringId, Value>,
    /// The global object
    pub global_object: ObjectId,
    /// The global lexical environment
    pub global_env: EnvId,
    /// Registered host-native functions
    natives: Vec<NativeFunction>,
    /// Back-edge/call budget per top-level entry; `None` means unlimited
    pub step_limit: Option<u64>,
    /// The exception currently being handled, while handlers run
    pub last_exception: Option<Value>,
}

impl Realm {
    /// Create a fresh realm.
    pub fn new() -> Self {
        let heap = Heap::new();
        let shapes = ShapeRegistry::new();
        let mut objects = ObjectHeap::new();
        let mut envs = EnvArena::new();
        let global_object = objects.alloc(JsObject::plain(shapes.root()));
        let global_env = envs.alloc(None, 0);
        Self {
            heap,
            objects,
            shapes,
            envs,
            ic_sites: IcSiteTable::new(),
            profiler: Profiler::new(),
            globals: HashMap::new(),
            global_object,
            global_env,
            natives: Vec::new(),
            step_limit: None,
            last_exception: None,
        }
    }

    /// Register a host-native function and return its callable value.
    pub fn register_native(&mut self, function: NativeFunction) -> Value {
        let index = self.natives.len() as u32;
        self.natives.push(function);
        let object = self.objects.alloc(JsObject {
            shape: self.shapes.root(),
            slots: Vec::new(),
            kind: ObjectKind::Native {
                native_index: index,
            },
        });
        Value::object(object)
    }

    /// Build the JavaScript `Error` object for an engine error.
    pub fn error_value(&mut self, error: &JsError) -> Value {
        let object = self.objects.alloc(JsObject::plain(self.shapes.root()));
        let name = self.heap.strings.intern_static("name");
        let message = self.heap.strings.intern_static("message");
        let name_value = Value::string(self.heap.strings.intern(error.kind.name()));
        let message_value = Value::string(self.heap.strings.intern(&error.message));
        self.objects
            .set_property(&mut self.shapes, object, name, name_value);
        self.objects
            .set_property(&mut self.shapes, object, message, message_value);
        Value::object(object)
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::new()
    }
}

/// `ToPrimitive` hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveHint {
    /// No hint (treated as number)
    Default,
    /// `"number"`
    Number,
    /// `"string"`
    String,
}

const MAX_CALL_DEPTH: usize = 512;

struct Replay {
    trace_id: u32,
    entry: BytecodeAddress,
    expected: Arc<Vec<u32>>,
    exit_resumes: Arc<Vec<u32>>,
    cursor: usize,
}

/// The bytecode interpreter for one program.
pub struct Interpreter<'a> {
    /// The realm being mutated
    pub realm: &'a mut Realm,
    /// The program being executed
    pub program: &'a LoweredProgram,
    /// Optional tracing-JIT hook
    pub tracer: Option<&'a mut dyn TraceRuntime>,
    frames: Vec<CallFrame>,
    steps: u64,
    replay: Option<Replay>,
}

impl<'a> Interpreter<'a> {
    /// Create an interpreter over `program`.
    pub fn new(realm: &'a mut Realm, program: &'a LoweredProgram) -> Self {
        Self {
            realm,
            program,
            tracer: None,
            frames: Vec::new(),
            steps: 0,
            replay: None,
        }
    }

    /// Attach a tracing-JIT hook.
    pub fn with_tracer(mut self, tracer: &'a mut dyn TraceRuntime) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Execute the top-level script and return its completion value.
    pub fn run(&mut self) -> Result<Value, JsError> {
        let program = self.program;
        let block = &program.functions[0];
        let needed = block.local_count as usize;
        // Grow the persistent global environment to the script's needs
        let env = self.realm.global_env;
        if needed > 0 && self.realm.envs.get(env).slots.len() < needed {
            self.realm
                .envs
                .write(env, 0, (needed - 1) as u16, Value::undefined());
        }
        let frame = CallFrame::global(0, self.realm.global_env, block.strict);
        self.steps = 0;
        match self.run_frame(frame) {
            Ok(value) => Ok(value),
            Err(exception) => Err(self.exception_to_error(exception)),
        }
    }

    /// Call a callable value from the host.
    pub fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, JsError> {
        match self.call_value(callee, this, args.to_vec()) {
            Ok(value) => Ok(value),
            Err(exception) => Err(self.exception_to_error(exception)),
        }
    }

    fn exception_to_error(&mut self, exception: Exception) -> JsError {
        if let Some(error) = exception.error {
            return error;
        }
        let message = self
            .value_to_display(exception.value)
            .unwrap_or_else(|| "uncaught exception".to_string());
        JsError::new(ErrorKind::InternalError, format!("Uncaught: {}", message))
    }

    fn value_to_display(&mut self, value: Value) -> Option<String> {
        if value.is_object() {
            return Some("[object Object]".to_string());
        }
        value
            .to_js_string(&self.realm.heap)
            .ok()
            .map(|id| self.realm.heap.strings.to_string(id))
    }

    fn raise(&mut self, mut error: JsError) -> Exception {
        // The stack property comes from the live call-frame chain; the
        // interpreter tracks byte offsets, which stand in for columns
        if error.stack.is_empty() {
            error.stack = self
                .frames
                .iter()
                .rev()
                .map(|frame| core_types::StackFrame {
                    function_name: None,
                    source_url: None,
                    line: frame.function_index.unwrap_or(0),
                    column: frame.ip as u32,
                })
                .collect();
        }
        let value = self.realm.error_value(&error);
        Exception {
            value,
            error: Some(error),
        }
    }

    fn check_limits(&mut self) -> Result<(), Exception> {
        self.steps += 1;
        if let Some(limit) = self.realm.step_limit {
            if self.steps > limit {
                let err = JsError::new(ErrorKind::RangeError, "Execution limit exceeded");
                return Err(self.raise(err));
            }
        }
        Ok(())
    }

    fn call_value(
        &mut self,
        callee: Value,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Exception> {
        let Some(object_id) = callee.as_object() else {
            let err = JsError::type_error(format!("{} is not a function", callee.type_of()));
            return Err(self.raise(err));
        };
        if self.frames.len() >= MAX_CALL_DEPTH {
            let err = JsError::new(ErrorKind::RangeError, "Maximum call stack size exceeded");
            return Err(self.raise(err));
        }
        self.realm.profiler.calls_executed += 1;
        self.check_limits()?;
        let kind = self.realm.objects.get(object_id).kind.clone();
        match kind {
            ObjectKind::Function {
                function_index,
                environment,
            } => {
                let program = self.program;
                let block = &program.functions[function_index as usize];
                let env = self
                    .realm
                    .envs
                    .alloc(Some(environment), block.local_count as usize);
                let strict = block.strict;
                let frame = CallFrame::function(
                    function_index,
                    env,
                    this,
                    args,
                    strict,
                    Some(self.frames.len().saturating_sub(1)),
                );
                self.run_frame(frame)
            }
            ObjectKind::Native { native_index } => {
                let function = self.realm.natives[native_index as usize];
                function(self, this, &args).map_err(|e| self.raise(e))
            }
            _ => {
                let err = JsError::type_error("value is not callable");
                Err(self.raise(err))
            }
        }
    }

    fn construct(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, Exception> {
        let instance = self
            .realm
            .objects
            .alloc(JsObject::plain(self.realm.shapes.root()));
        let this = Value::object(instance);
        let result = self.call_value(callee, this, args)?;
        Ok(if result.is_object() { result } else { this })
    }

    fn to_primitive(&mut self, value: Value, hint: PrimitiveHint) -> Result<Value, Exception> {
        let Some(object_id) = value.as_object() else {
            return Ok(value);
        };
        let (first, second) = match hint {
            PrimitiveHint::String => ("toString", "valueOf"),
            _ => ("valueOf", "toString"),
        };
        for method_name in [first, second] {
            let name = self.realm.heap.strings.intern_static(method_name);
            let method = self
                .realm
                .objects
                .get_property(&self.realm.shapes, object_id, name);
            if let Some(method) = method {
                if method
                    .as_object()
                    .map(|id| self.realm.objects.get(id).is_callable())
                    .unwrap_or(false)
                {
                    let result = self.call_value(method, value, Vec::new())?;
                    if !result.is_object() {
                        return Ok(result);
                    }
                }
            }
        }
        let err = JsError::type_error("Cannot convert object to primitive value");
        Err(self.raise(err))
    }

    fn to_number(&mut self, value: Value) -> Result<f64, Exception> {
        let primitive = self.to_primitive(value, PrimitiveHint::Number)?;
        primitive
            .to_number(&self.realm.heap)
            .map_err(|e| self.raise(e))
    }

    fn to_int32(&mut self, value: Value) -> Result<i32, Exception> {
        let primitive = self.to_primitive(value, PrimitiveHint::Number)?;
        primitive
            .to_int32(&self.realm.heap)
            .map_err(|e| self.raise(e))
    }

    fn to_string_id(&mut self, value: Value) -> Result<StringId, Exception> {
        let primitive = self.to_primitive(value, PrimitiveHint::String)?;
        primitive
            .to_js_string(&self.realm.heap)
            .map_err(|e| self.raise(e))
    }

    fn to_boolean(&mut self, value: Value) -> bool {
        value.to_boolean(&self.realm.heap)
    }

    fn number_value(int_candidate: f64) -> Value {
        if int_candidate.fract() == 0.0
            && int_candidate >= i32::MIN as f64
            && int_candidate <= i32::MAX as f64
            && !(int_candidate == 0.0 && int_candidate.is_sign_negative())
        {
            Value::int32(int_candidate as i32)
        } else {
            Value::number(int_candidate)
        }
    }

    fn bigint_pair(&self, a: Value, b: Value) -> Option<(Arc<JsBigInt>, Arc<JsBigInt>)> {
        match (a.as_bigint(), b.as_bigint()) {
            (Some(x), Some(y)) => Some((self.realm.heap.bigint(x), self.realm.heap.bigint(y))),
            _ => None,
        }
    }

    fn push_bigint(&mut self, value: JsBigInt) -> Value {
        Value::bigint(self.realm.heap.alloc_bigint(value))
    }

    fn binary_add(&mut self, a: Value, b: Value) -> Result<Value, Exception> {
        // Fast path: both int32
        if let (Some(x), Some(y)) = (a.as_int32(), b.as_int32()) {
            if let Some(sum) = x.checked_add(y) {
                return Ok(Value::int32(sum));
            }
            return Ok(Value::number(x as f64 + y as f64));
        }
        let pa = self.to_primitive(a, PrimitiveHint::Default)?;
        let pb = self.to_primitive(b, PrimitiveHint::Default)?;
        if pa.is_string() || pb.is_string() {
            let sa = self.to_string_id(pa)?;
            let sb = self.to_string_id(pb)?;
            return Ok(Value::string(self.realm.heap.strings.concat(sa, sb)));
        }
        if let Some((x, y)) = self.bigint_pair(pa, pb) {
            return Ok(self.push_bigint(x.add(&y)));
        }
        if pa.is_bigint() || pb.is_bigint() {
            let err = JsError::type_error("Cannot mix BigInt and other types in addition");
            return Err(self.raise(err));
        }
        let x = self.to_number(pa)?;
        let y = self.to_number(pb)?;
        Ok(Self::number_value(x + y))
    }

    fn binary_numeric(
        &mut self,
        op: Opcode,
        a: Value,
        b: Value,
    ) -> Result<Value, Exception> {
        if let Some((x, y)) = self.bigint_pair(a, b) {
            let result = match op {
                Opcode::Sub => x.sub(&y),
                Opcode::Mul => x.mul(&y),
                Opcode::Div => x.div_rem(&y).map_err(|e| self.raise(e))?.0,
                Opcode::Mod => x.div_rem(&y).map_err(|e| self.raise(e))?.1,
                _ => unreachable!(),
            };
            return Ok(self.push_bigint(result));
        }
        // Integer arithmetic stays integral except for division
        if let (Some(x), Some(y)) = (a.as_int32(), b.as_int32()) {
            match op {
                Opcode::Sub => {
                    if let Some(v) = x.checked_sub(y) {
                        return Ok(Value::int32(v));
                    }
                }
                Opcode::Mul => {
                    if let Some(v) = x.checked_mul(y) {
                        if !(v == 0 && (x < 0 || y < 0)) {
                            return Ok(Value::int32(v));
                        }
                    }
                }
                _ => {}
            }
        }
        let x = self.to_number(a)?;
        let y = self.to_number(b)?;
        let result = match op {
            Opcode::Sub => x - y,
            Opcode::Mul => x * y,
            Opcode::Div => x / y,
            Opcode::Mod => x % y,
            _ => unreachable!(),
        };
        Ok(Self::number_value(result))
    }

    fn binary_bitwise(&mut self, op: Opcode, a: Value, b: Value) -> Result<Value, Exception> {
        if let Some((x, y)) = self.bigint_pair(a, b) {
            let result = match op {
                Opcode::BitAnd => x.bit_and(&y),
                Opcode::BitOr => x.bit_or(&y),
                Opcode::BitXor => x.bit_xor(&y),
                Opcode::ShiftLeft => {
                    let amount = y.to_f64();
                    x.shl(amount.max(0.0) as u64)
                }
                Opcode::ShiftRight => {
                    let amount = y.to_f64();
                    x.shr(amount.max(0.0) as u64)
                }
                _ => {
                    let err = JsError::type_error("BigInts have no unsigned right shift");
                    return Err(self.raise(err));
                }
            };
            return Ok(self.push_bigint(result));
        }
        let x = self.to_int32(a)?;
        let y = self.to_int32(b)?;
        let result = match op {
            Opcode::BitAnd => x & y,
            Opcode::BitOr => x | y,
            Opcode::BitXor => x ^ y,
            Opcode::ShiftLeft => x.wrapping_shl(y as u32 & 31),
            Opcode::ShiftRight => x.wrapping_shr(y as u32 & 31),
            Opcode::UShiftRight => {
                let unsigned = (x as u32).wrapping_shr(y as u32 & 31);
                return Ok(Self::number_value(unsigned as f64));
            }
            _ => unreachable!(),
        };
        Ok(Value::int32(result))
    }

    fn compare(&mut self, op: Opcode, a: Value, b: Value) -> Result<Value, Exception> {
        use std::cmp::Ordering;
        let pa = self.to_primitive(a, PrimitiveHint::Number)?;
        let pb = self.to_primitive(b, PrimitiveHint::Number)?;

        let ordering: Option<Ordering> = if pa.is_string() && pb.is_string() {
            let sa = self.realm.heap.strings.to_string(pa.as_string().unwrap());
            let sb = self.realm.heap.strings.to_string(pb.as_string().unwrap());
            Some(sa.cmp(&sb))
        } else if let Some((x, y)) = self.bigint_pair(pa, pb) {
            Some(x.compare(&y))
        } else if pa.is_bigint() || pb.is_bigint() {
            let (big, other, flipped) = if pa.is_bigint() {
                (pa, pb, false)
            } else {
                (pb, pa, true)
            };
            let x = self.realm.heap.bigint(big.as_bigint().unwrap()).to_f64();
            let y = self.to_number(other)?;
            let ord = x.partial_cmp(&y);
            if flipped {
                ord.map(Ordering::reverse)
            } else {
                ord
            }
        } else {
            let x = self.to_number(pa)?;
            let y = self.to_number(pb)?;
            x.partial_cmp(&y)
        };

        let result = match (op, ordering) {
            (_, None) => false, // NaN involved
            (Opcode::LessThan, Some(o)) => o == Ordering::Less,
            (Opcode::LessThanOrEqual, Some(o)) => o != Ordering::Greater,
            (Opcode::GreaterThan, Some(o)) => o == Ordering::Greater,
            (Opcode::GreaterThanOrEqual, Some(o)) => o != Ordering::Less,
            _ => unreachable!(),
        };
        Ok(Value::boolean(result))
    }

    fn loosely_equals(&mut self, a: Value, b: Value) -> Result<bool, Exception> {
        if a.is_object() && b.is_object() {
            return Ok(a.as_object() == b.as_object());
        }
        let pa = if a.is_object() {
            self.to_primitive(a, PrimitiveHint::Default)?
        } else {
            a
        };
        let pb = if b.is_object() {
            self.to_primitive(b, PrimitiveHint::Default)?
        } else {
            b
        };
        Ok(pa.loose_equals(pb, &self.realm.heap).unwrap_or(false))
    }

    fn load_constant(&mut self, function_index: u32, index: u32, env: EnvId) -> Value {
        let program = self.program;
        let constant = &program.functions[function_index as usize].constants[index as usize];
        match constant {
            Constant::Number(n) => Value::number(*n),
            Constant::String(id) => Value::string(*id),
            Constant::BigInt(big) => {
                let cloned = big.clone();
                Value::bigint(self.realm.heap.alloc_bigint(cloned))
            }
            Constant::Function(nested) => {
                let object = self.realm.objects.alloc(JsObject {
                    shape: self.realm.shapes.root(),
                    slots: Vec::new(),
                    kind: ObjectKind::Function {
                        function_index: *nested,
                        environment: env,
                    },
                });
                Value::object(object)
            }
        }
    }

    fn get_property_cached(
        &mut self,
        function_index: u32,
        site_index: u16,
        kind: IcSiteKind,
        receiver: Value,
        name: StringId,
    ) -> Result<Value, Exception> {
        if receiver.is_nullish() {
            let text = self.realm.heap.strings.to_string(name);
            let err = JsError::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                receiver.type_of(),
                text
            ));
            return Err(self.raise(err));
        }
        let Some(object_id) = receiver.as_object() else {
            // Primitive receivers would box; without builtin prototypes
            // there is nothing to find on the wrapper.
            return Ok(Value::undefined());
        };
        let shape = self.realm.objects.get(object_id).shape;
        let site = self.realm.ic_sites.site(function_index, site_index, kind);
        if let Some(entry) = site.lookup(CacheKey::Shape(shape)) {
            let value = self.realm.objects.get(object_id).slots
                [entry.offset as usize];
            return Ok(value);
        }
        // Miss: full lookup, then install a fresh entry
        let value = self
            .realm
            .objects
            .get_property(&self.realm.shapes, object_id, name);
        if let Some(value) = value {
            let offset = self
                .realm
                .shapes
                .get(shape)
                .offset_of(name)
                .expect("property present implies an offset");
            let site = self.realm.ic_sites.site(function_index, site_index, kind);
            site.install(IcEntry {
                key: CacheKey::Shape(shape),
                offset,
                handler: 0,
            });
            Ok(value)
        } else {
            Ok(Value::undefined())
        }
    }

    fn set_property_cached(
        &mut self,
        function_index: u32,
        site_index: u16,
        receiver: Value,
        name: StringId,
        value: Value,
    ) -> Result<(), Exception> {
        let Some(object_id) = receiver.as_object() else {
            let err = JsError::type_error("Cannot set properties of a non-object");
            return Err(self.raise(err));
        };
        self.realm
            .objects
            .set_property(&mut self.realm.shapes, object_id, name, value);
        let shape = self.realm.objects.get(object_id).shape;
        let offset = self
            .realm
            .shapes
            .get(shape)
            .offset_of(name)
            .expect("just stored");
        let site = self
            .realm
            .ic_sites
            .site(function_index, site_index, IcSiteKind::Property);
        if site.lookup(CacheKey::Shape(shape)).is_none() {
            site.install(IcEntry {
                key: CacheKey::Shape(shape),
                offset,
                handler: 0,
            });
        }
        Ok(())
    }

    fn on_back_edge(
        &mut self,
        function_index: u32,
        target: u32,
    ) -> Result<(), Exception> {
        self.realm.profiler.back_edges += 1;
        self.check_limits()?;
        let address = BytecodeAddress::new(function_index, target);
        if let Some(tracer) = self.tracer.as_deref_mut() {
            if let Some(installed) = tracer.trace_at(address) {
                self.realm.profiler.record_trace_hit();
                match &mut self.replay {
                    Some(replay) if replay.entry == address => {
                        // Loop closed while replaying: start the next lap
                        replay.cursor = 0;
                    }
                    _ => {
                        self.replay = Some(Replay {
                            trace_id: installed.trace_id,
                            entry: address,
                            expected: installed.expected_offsets,
                            exit_resumes: installed.exit_resume_offsets,
                            cursor: 0,
                        });
                    }
                }
            } else {
                tracer.record_entry(address);
            }
        }
        Ok(())
    }

    fn replay_step(&mut self, function_index: u32, offset: u32) {
        // None = still on trace; Some(None) = planned guard exit;
        // Some(Some(id)) = unexpected divergence
        let outcome: Option<Option<u32>> = match &mut self.replay {
            None => return,
            Some(replay) => match replay.expected.get(replay.cursor) {
                Some(&expected) if expected == offset => {
                    replay.cursor += 1;
                    None
                }
                // Landing on a planned guard resume is the trace ending
                // normally, not a side exit
                _ if replay.exit_resumes.contains(&offset) => Some(None),
                _ => Some(Some(replay.trace_id)),
            },
        };
        match outcome {
            None => {}
            Some(None) => {
                self.replay = None;
            }
            Some(Some(trace_id)) => {
                self.replay = None;
                let resume = BytecodeAddress::new(function_index, offset);
                self.realm
                    .profiler
                    .record_side_exit(SideExitKind::GuardFailure);
                if let Some(tracer) = self.tracer.as_deref_mut() {
                    tracer.record_side_exit(trace_id, SideExitKind::GuardFailure, resume);
                }
            }
        }
    }

    fn replay_exception(&mut self, function_index: u32, offset: u32) {
        if let Some(replay) = self.replay.take() {
            let resume = BytecodeAddress::new(function_index, offset);
            self.realm
                .profiler
                .record_side_exit(SideExitKind::ExceptionThrown);
            if let Some(tracer) = self.tracer.as_deref_mut() {
                tracer.record_side_exit(replay.trace_id, SideExitKind::ExceptionThrown, resume);
            }
        }
    }

    fn run_frame(&mut self, frame: CallFrame) -> Result<Value, Exception> {
        let function_index = frame
            .function_index
            .expect("interpreted frames carry bytecode");
        let frame_slot = self.frames.len();
        self.frames.push(frame);
        let result = self.dispatch_loop(frame_slot, function_index);
        self.frames.pop();
        result
    }

    fn dispatch_loop(
        &mut self,
        frame_slot: usize,
        function_index: u32,
    ) -> Result<Value, Exception> {
        let program = self.program;
        let block = &program.functions[function_index as usize];
        let mut stack: Vec<Value> = Vec::new();
        loop {
            let ip = self.frames[frame_slot].ip;
            let mut decoder = block.decoder();
            if decoder.seek(ip).is_err() {
                let err = JsError::internal("instruction pointer out of range");
                return Err(self.raise(err));
            }
            let Some(inst) = decoder.next_instruction().map_err(|e| {
                let err = JsError::new(ErrorKind::InternalError, e.to_string());
                self.raise(err)
            })?
            else {
                // Fell off the end; blocks always end in Return, so this
                // only happens for empty blocks
                return Ok(Value::undefined());
            };
            self.frames[frame_slot].ip = decoder.tell();

            if let Some(tracer) = self.tracer.as_deref_mut() {
                let address = BytecodeAddress::new(function_index, inst.offset as u32);
                tracer.record_instruction(address, &inst);
            }
            self.replay_step(function_index, inst.offset as u32);

            match self.execute(frame_slot, function_index, &inst, &mut stack) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Jump(target)) => {
                    if (target as usize) < inst.offset {
                        self.on_back_edge(function_index, target)?;
                    }
                    self.frames[frame_slot].ip = target as usize;
                }
                Ok(Flow::Return(value)) => {
                    self.frames[frame_slot].complete(value);
                    return Ok(value);
                }
                Ok(Flow::Suspend(value)) => {
                    self.frames[frame_slot].suspend();
                    return Ok(value);
                }
                Err(exception) => {
                    self.replay_exception(function_index, inst.offset as u32);
                    match block.handler_for(inst.offset as u32) {
                        Some(handler) => {
                            self.realm.last_exception = Some(exception.value);
                            stack.clear();
                            stack.push(exception.value);
                            self.frames[frame_slot].ip = handler as usize;
                        }
                        None => {
                            self.frames[frame_slot].abort();
                            return Err(exception);
                        }
                    }
                }
            }
        }
    }

    fn execute(
        &mut self,
        frame_slot: usize,
        function_index: u32,
        inst: &DecodedInstruction,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, Exception> {
        let program = self.program;
        let block = &program.functions[function_index as usize];
        macro_rules! pop {
            () => {
                stack.pop().unwrap_or(Value::undefined())
            };
        }
        match inst.opcode {
            Opcode::Nop | Opcode::Phi | Opcode::FunctionHeader => {}
            Opcode::LoadConst => {
                let env = self.frames[frame_slot].environment;
                let value = self.load_constant(function_index, inst.operands[0], env);
                stack.push(value);
            }
            Opcode::LoadUndefined => stack.push(Value::undefined()),
            Opcode::LoadNull => stack.push(Value::null()),
            Opcode::LoadTrue => stack.push(Value::boolean(true)),
            Opcode::LoadFalse => stack.push(Value::boolean(false)),
            Opcode::LoadNumber => {
                let n = inst.number_operand();
                stack.push(if n.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&n)
                    && !(n == 0.0 && n.is_sign_negative())
                {
                    Value::int32(n as i32)
                } else {
                    Value::number(n)
                });
            }
            Opcode::LoadString => stack.push(Value::string(StringId(inst.operands[0]))),
            Opcode::LoadLocal => {
                let env = self.frames[frame_slot].environment;
                stack.push(self.realm.envs.read(env, 0, inst.operands[0] as u16));
            }
            Opcode::StoreLocal => {
                let value = pop!();
                let env = self.frames[frame_slot].environment;
                self.realm
                    .envs
                    .write(env, 0, inst.operands[0] as u16, value);
            }
            Opcode::LoadVar => {
                let env = self.frames[frame_slot].environment;
                stack.push(self.realm.envs.read(
                    env,
                    inst.operands[0],
                    inst.operands[1] as u16,
                ));
            }
            Opcode::StoreVar => {
                let value = pop!();
                let env = self.frames[frame_slot].environment;
                self.realm
                    .envs
                    .write(env, inst.operands[0], inst.operands[1] as u16, value);
            }
            Opcode::GetParameter => {
                let value = self.frames[frame_slot]
                    .args
                    .get(inst.operands[0] as usize)
                    .copied()
                    .unwrap_or(Value::undefined());
                stack.push(value);
            }
            Opcode::LoadGlobal => {
                let name = StringId(inst.operands[0]);
                match self.realm.globals.get(&name).copied() {
                    Some(value) => stack.push(value),
                    None => {
                        let text = self.realm.heap.strings.to_string(name);
                        let err = JsError::reference_error(format!("{} is not defined", text));
                        return Err(self.raise(err));
                    }
                }
            }
            Opcode::StoreGlobal => {
                let value = pop!();
                let name = StringId(inst.operands[0]);
                self.realm.globals.insert(name, value);
            }
            Opcode::LoadThis => stack.push(self.frames[frame_slot].this_value),
            Opcode::Add => {
                let b = pop!();
                let a = pop!();
                stack.push(self.binary_add(a, b)?);
            }
            Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let b = pop!();
                let a = pop!();
                stack.push(self.binary_numeric(inst.opcode, a, b)?);
            }
            Opcode::Neg => {
                let value = pop!();
                if let Some(id) = value.as_bigint() {
                    let negated = self.realm.heap.bigint(id).negate();
                    let result = self.push_bigint(negated);
                    stack.push(result);
                } else if let Some(x) = value.as_int32() {
                    match x.checked_neg() {
                        Some(v) if x != 0 => stack.push(Value::int32(v)),
                        _ => stack.push(Value::number(-(x as f64))),
                    }
                } else {
                    let x = self.to_number(value)?;
                    stack.push(Value::number(-x));
                }
            }
            Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::UShiftRight => {
                let b = pop!();
                let a = pop!();
                stack.push(self.binary_bitwise(inst.opcode, a, b)?);
            }
            Opcode::BitNot => {
                let value = pop!();
                if let Some(id) = value.as_bigint() {
                    let result = self.realm.heap.bigint(id).bit_not();
                    let result = self.push_bigint(result);
                    stack.push(result);
                } else {
                    let x = self.to_int32(value)?;
                    stack.push(Value::int32(!x));
                }
            }
            Opcode::Not => {
                let value = pop!();
                let b = self.to_boolean(value);
                stack.push(Value::boolean(!b));
            }
            Opcode::Equal | Opcode::NotEqual => {
                let b = pop!();
                let a = pop!();
                let eq = self.loosely_equals(a, b)?;
                stack.push(Value::boolean(eq == (inst.opcode == Opcode::Equal)));
            }
            Opcode::StrictEqual | Opcode::StrictNotEqual => {
                let b = pop!();
                let a = pop!();
                let eq = a.strict_equals(b, &self.realm.heap);
                stack.push(Value::boolean(eq == (inst.opcode == Opcode::StrictEqual)));
            }
            Opcode::LessThan
            | Opcode::LessThanOrEqual
            | Opcode::GreaterThan
            | Opcode::GreaterThanOrEqual => {
                let b = pop!();
                let a = pop!();
                stack.push(self.compare(inst.opcode, a, b)?);
            }
            Opcode::Jump => return Ok(Flow::Jump(inst.operands[0])),
            Opcode::JumpIfTrue => {
                let value = pop!();
                if self.to_boolean(value) {
                    return Ok(Flow::Jump(inst.operands[0]));
                }
            }
            Opcode::JumpIfFalse => {
                let value = pop!();
                if !self.to_boolean(value) {
                    return Ok(Flow::Jump(inst.operands[0]));
                }
            }
            Opcode::Call | Opcode::TailCall => {
                let argc = inst.operands[0] as usize;
                let mut args = vec![Value::undefined(); argc];
                for slot in args.iter_mut().rev() {
                    *slot = pop!();
                }
                let callee = pop!();
                let result = self.call_value(callee, Value::undefined(), args)?;
                if inst.opcode == Opcode::TailCall {
                    return Ok(Flow::Return(result));
                }
                stack.push(result);
            }
            Opcode::New => {
                let argc = inst.operands[0] as usize;
                let mut args = vec![Value::undefined(); argc];
                for slot in args.iter_mut().rev() {
                    *slot = pop!();
                }
                let callee = pop!();
                stack.push(self.construct(callee, args)?);
            }
            Opcode::Return => {
                let value = pop!();
                return Ok(Flow::Return(value));
            }
            Opcode::Throw => {
                let value = pop!();
                return Err(Exception { value, error: None });
            }
            Opcode::GetProperty => {
                let receiver = pop!();
                let name = StringId(inst.operands[0]);
                let site_index = inst.operands[1] as u16;
                let kind = block
                    .ic_sites
                    .get(site_index as usize)
                    .copied()
                    .unwrap_or(IcSiteKind::Property);
                let value =
                    self.get_property_cached(function_index, site_index, kind, receiver, name)?;
                stack.push(value);
            }
            Opcode::SetProperty => {
                let value = pop!();
                let receiver = pop!();
                let name = StringId(inst.operands[0]);
                let site_index = inst.operands[1] as u16;
                self.set_property_cached(function_index, site_index, receiver, name, value)?;
                stack.push(value);
            }
            Opcode::GetElement => {
                let key = pop!();
                let receiver = pop!();
                let Some(object_id) = receiver.as_object() else {
                    let err = JsError::type_error("Cannot index a non-object");
                    return Err(self.raise(err));
                };
                let index = self.to_number(key)?;
                if index.fract() == 0.0 && index >= 0.0 {
                    stack.push(self.realm.objects.get_element(object_id, index as usize));
                } else {
                    stack.push(Value::undefined());
                }
            }
            Opcode::SetElement => {
                let value = pop!();
                let key = pop!();
                let receiver = pop!();
                let Some(object_id) = receiver.as_object() else {
                    let err = JsError::type_error("Cannot index a non-object");
                    return Err(self.raise(err));
                };
                let index = self.to_number(key)?;
                if index.fract() != 0.0 || index < 0.0 {
                    let err = JsError::range_error("Invalid array index");
                    return Err(self.raise(err));
                }
                self.realm
                    .objects
                    .set_element(object_id, index as usize, value)
                    .map_err(|e| self.raise(e))?;
                stack.push(value);
            }
            Opcode::CreateObject => {
                let object = self
                    .realm
                    .objects
                    .alloc(JsObject::plain(self.realm.shapes.root()));
                stack.push(Value::object(object));
            }
            Opcode::CreateArray => {
                let count = inst.operands[0] as usize;
                let mut elements = vec![Value::undefined(); count];
                for slot in elements.iter_mut().rev() {
                    *slot = pop!();
                }
                let object = self.realm.objects.alloc(JsObject {
                    shape: self.realm.shapes.root(),
                    slots: Vec::new(),
                    kind: ObjectKind::Array { elements },
                });
                stack.push(Value::object(object));
            }
            Opcode::Pop => {
                let _ = pop!();
            }
            Opcode::Dup => {
                let top = stack.last().copied().unwrap_or(Value::undefined());
                stack.push(top);
            }
            Opcode::Await | Opcode::Yield => {
                let value = pop!();
                return Ok(Flow::Suspend(value));
            }
            Opcode::FastInvSqrt => {
                let value = pop!();
                let x = self.to_number(value)?;
                stack.push(Value::number(1.0 / x.sqrt()));
            }
            Opcode::FastSin | Opcode::FastCos | Opcode::FastExp | Opcode::FastLog => {
                let value = pop!();
                let x = self.to_number(value)?;
                let result = match inst.opcode {
                    Opcode::FastSin => x.sin(),
                    Opcode::FastCos => x.cos(),
                    Opcode::FastExp => x.exp(),
                    _ => x.ln(),
                };
                stack.push(Value::number(result));
            }
            Opcode::SimdLoad
            | Opcode::SimdStore
            | Opcode::SimdAdd
            | Opcode::SimdSub
            | Opcode::SimdMul
            | Opcode::SimdDiv
            | Opcode::SimdCompare
            | Opcode::Fma => {
                // Vector opcodes exist only in optimizer output consumed by
                // the JIT tiers; reaching one here is an engine bug
                let err = JsError::internal("vector opcode in interpreted code");
                return Err(self.raise(err));
            }
        }
        Ok(Flow::Continue)
    }
}

enum Flow {
    Continue,
    Jump(u32),
    Return(Value),
    Suspend(Value),
}

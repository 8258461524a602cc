//! Baseline JIT compiler.
//!
//! Lowers bytecode to call-threaded native code: each bytecode
//! instruction becomes a call into the runtime dispatch helper with the
//! instruction index as argument. Loop-head targets are cache-line
//! aligned during finalization. The compiler also owns inline-cache
//! wiring: every IC point gets a stable site id, its miss-handler
//! pointer, and specialized handler stubs generated on demand as entries
//! are installed.

use crate::code_cache::{CacheError, CodeCache, CodeRegion};
use crate::codegen::{emitter_for, Architecture, NativeEmitter};
use bytecode_system::{BytecodeBlock, Constant, ExceptionTableEntry, IcSiteKind};
use core_types::{CompileError, CompileErrorKind, StringId, Value};
use runtime::{CacheKey, IcEntry, IcSiteTable, ObjectHeap, ShapeId, ShapeRegistry};
use std::collections::HashMap;

/// Upper bound on one function's code region.
const MAX_REGION: usize = 1 << 20;

/// Addresses of the runtime entry points baseline code calls into.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHelpers {
    /// Per-instruction dispatch helper
    pub dispatch: usize,
    /// Generic property lookup used by megamorphic sites
    pub generic_property: usize,
    /// Property-miss entry
    pub property_miss: usize,
    /// Method-miss entry
    pub method_miss: usize,
    /// Type-check-miss entry
    pub type_check_miss: usize,
}

impl RuntimeHelpers {
    /// Placeholder helpers for tests that never execute the code.
    pub fn stubs() -> Self {
        Self {
            dispatch: 0x1000,
            generic_property: 0x2000,
            property_miss: 0x3000,
            method_miss: 0x4000,
            type_check_miss: 0x5000,
        }
    }
}

/// Compilation statistics.
#[derive(Debug, Clone, Default)]
pub struct BaselineStats {
    /// Number of functions compiled
    pub functions_compiled: u64,
    /// Total code size generated
    pub total_code_size: usize,
    /// Compilations that failed and fell back to the interpreter
    pub failed_compiles: u64,
}

/// One compiled function.
pub struct CompiledFunction {
    /// The compiled function's id
    pub function_id: u32,
    /// Executable region holding the code
    pub region: CodeRegion,
    /// Bytes of native code
    pub code_size: usize,
    /// Side table of the function's literal values
    pub literal_table: Vec<Constant>,
    /// Site ids of the function's inline caches
    pub ic_site_ids: Vec<u64>,
    /// The function's try/catch ranges
    pub exception_table: Vec<ExceptionTableEntry>,
    /// `bytecode offset <-> native offset` pairs, when debugging is on
    pub offset_map: Option<Vec<(u32, u32)>>,
}

/// The baseline compiler.
pub struct BaselineJit {
    arch: Architecture,
    helpers: RuntimeHelpers,
    debug_info: bool,
    compiled: HashMap<u32, CompiledFunction>,
    stats: BaselineStats,
    handler_stubs: Vec<CodeRegion>,
}

impl BaselineJit {
    /// Create a baseline compiler for an architecture.
    pub fn new(arch: Architecture, helpers: RuntimeHelpers, debug_info: bool) -> Self {
        Self {
            arch,
            helpers,
            debug_info,
            compiled: HashMap::new(),
            stats: BaselineStats::default(),
            handler_stubs: Vec::new(),
        }
    }

    /// Compilation statistics.
    pub fn stats(&self) -> &BaselineStats {
        &self.stats
    }

    /// The compiled form of a function, if present.
    pub fn compiled(&self, function_id: u32) -> Option<&CompiledFunction> {
        self.compiled.get(&function_id)
    }

    /// Compile a function. Idempotent per function id: recompiling an
    /// already-compiled function returns the existing code.
    pub fn compile(
        &mut self,
        function_id: u32,
        block: &BytecodeBlock,
        cache: &CodeCache,
        ic_sites: &mut IcSiteTable,
    ) -> Result<&CompiledFunction, CompileError> {
        if self.compiled.contains_key(&function_id) {
            return Ok(&self.compiled[&function_id]);
        }

        let estimated = (block.code.len() * 10).max(256).min(MAX_REGION);
        let mut region = cache.alloc(estimated).map_err(|e| {
            self.stats.failed_compiles += 1;
            CompileError::new(CompileErrorKind::InvalidBytecode, 0, e.to_string())
        })?;

        let emit_result = self.emit_function(block);
        let (code, offset_map) = match emit_result {
            Ok(parts) => parts,
            Err(e) => {
                // The region drops here and its bytes return to the cache
                drop(region);
                self.stats.failed_compiles += 1;
                return Err(e);
            }
        };
        if let Err(err) = region.install(&code) {
            drop(region);
            self.stats.failed_compiles += 1;
            let kind = match err {
                CacheError::TooLarge { .. } => CompileErrorKind::InvalidBytecode,
                _ => CompileErrorKind::InvalidBytecode,
            };
            return Err(CompileError::new(kind, 0, err.to_string()));
        }

        // Inline-cache setup: stable site ids and miss-handler pointers
        let mut ic_site_ids = Vec::new();
        for (index, kind) in block.ic_sites.iter().enumerate() {
            let site = ic_sites.site(function_id, index as u16, *kind);
            site.generic_handler = self.helpers.generic_property;
            site.miss_handler = match kind {
                IcSiteKind::Property => self.helpers.property_miss,
                IcSiteKind::Method => self.helpers.method_miss,
                IcSiteKind::TypeCheck => self.helpers.type_check_miss,
            };
            ic_site_ids.push(site.site_id);
        }

        let code_size = code.len();
        self.stats.functions_compiled += 1;
        self.stats.total_code_size += code_size;
        tracing::debug!(
            function_id,
            code_size,
            sites = ic_site_ids.len(),
            "baseline compiled"
        );

        let compiled = CompiledFunction {
            function_id,
            region,
            code_size,
            literal_table: block.constants.clone(),
            ic_site_ids,
            exception_table: block.exception_table.clone(),
            offset_map: self.debug_info.then_some(offset_map),
        };
        self.compiled.insert(function_id, compiled);
        Ok(&self.compiled[&function_id])
    }

    /// Emit call-threaded code for one block.
    #[allow(clippy::type_complexity)]
    fn emit_function(
        &self,
        block: &BytecodeBlock,
    ) -> Result<(Vec<u8>, Vec<(u32, u32)>), CompileError> {
        let mut decoder = block.decoder();
        let mut instructions = Vec::new();
        loop {
            match decoder.next_instruction() {
                Ok(Some(inst)) => instructions.push(inst),
                Ok(None) => break,
                Err(e) => {
                    return Err(CompileError::new(
                        CompileErrorKind::InvalidBytecode,
                        instructions.len(),
                        e.to_string(),
                    ))
                }
            }
        }
        // Backward jump targets are loop heads and get alignment
        let mut loop_heads = Vec::new();
        for inst in &instructions {
            if inst.opcode.is_jump() && (inst.operands[0] as usize) < inst.offset {
                loop_heads.push(inst.operands[0]);
            }
        }

        let mut emitter = emitter_for(self.arch);
        let args = emitter.arg_regs();
        let (scratch, _) = emitter.scratch_regs();
        // The context pointer arrives in arg0 and is threaded through to
        // every dispatch call untouched
        let index_arg = args[1];

        emitter.emit_prologue(0);
        let mut offset_map = Vec::new();
        for (index, inst) in instructions.iter().enumerate() {
            if loop_heads.contains(&(inst.offset as u32)) {
                emitter.align_to(16);
            }
            offset_map.push((inst.offset as u32, emitter.offset() as u32));
            emitter.emit_move_imm64(index_arg, index as u64);
            emitter.emit_move_imm64(scratch, self.helpers.dispatch as u64);
            emitter.emit_call_reg(scratch);
        }
        emitter.emit_epilogue();
        Ok((emitter.finish(), offset_map))
    }

    fn make_property_stub(&mut self, cache: &CodeCache, shape: ShapeId, offset: u32) -> usize {
        let mut emitter = emitter_for(self.arch);
        // The specialized handler inlines the shape check constant and the
        // slot offset: callers compare the packed word it returns
        let packed = ((shape as u64) << 16) | offset as u64;
        emitter.emit_move_imm64(emitter.return_reg(), packed);
        emitter.emit_epilogue();
        let code = emitter.finish();
        match cache.alloc(code.len()) {
            Ok(mut region) => {
                if region.install(&code).is_err() {
                    return self.helpers.generic_property;
                }
                let entry = region.entry();
                self.handler_stubs.push(region);
                entry
            }
            Err(_) => self.helpers.generic_property,
        }
    }

    /// Property-miss handler: box a primitive receiver, fetch its shape,
    /// look the property up, and install a specialized entry. Returns the
    /// handler the site should dispatch to next time.
    pub fn handle_property_cache_miss(
        &mut self,
        cache: &CodeCache,
        ic_sites: &mut IcSiteTable,
        function_id: u32,
        site_index: u16,
        shapes: &ShapeRegistry,
        objects: &ObjectHeap,
        receiver: Value,
        name: StringId,
    ) -> usize {
        let Some(object_id) = receiver.as_object() else {
            // Primitive receivers box to wrappers; with no builtin
            // prototypes the wrapper has nothing cacheable on it
            return self.helpers.generic_property;
        };
        let shape = objects.get(object_id).shape;
        let Some(offset) = shapes.get(shape).offset_of(name) else {
            return self.helpers.generic_property;
        };
        let handler = self.make_property_stub(cache, shape, offset);
        let site = ic_sites.site(function_id, site_index, IcSiteKind::Property);
        site.install(IcEntry {
            key: CacheKey::Shape(shape),
            offset,
            handler,
        })
    }

    /// Method-miss handler: identical to the property path, but the
    /// looked-up slot must be callable.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_method_cache_miss(
        &mut self,
        cache: &CodeCache,
        ic_sites: &mut IcSiteTable,
        function_id: u32,
        site_index: u16,
        shapes: &ShapeRegistry,
        objects: &ObjectHeap,
        receiver: Value,
        name: StringId,
    ) -> usize {
        let Some(object_id) = receiver.as_object() else {
            return self.helpers.generic_property;
        };
        let shape = objects.get(object_id).shape;
        let Some(offset) = shapes.get(shape).offset_of(name) else {
            return self.helpers.generic_property;
        };
        let callable = objects
            .get_property(shapes, object_id, name)
            .and_then(|v| v.as_object())
            .map(|id| objects.get(id).is_callable())
            .unwrap_or(false);
        if !callable {
            return self.helpers.generic_property;
        }
        let handler = self.make_property_stub(cache, shape, offset);
        let site = ic_sites.site(function_id, site_index, IcSiteKind::Method);
        site.install(IcEntry {
            key: CacheKey::Shape(shape),
            offset,
            handler,
        })
    }

    /// Type-check-miss handler: record the observed type and hand back a
    /// specialized type-test handler. Returns `(handler, matched)` where
    /// `matched` says whether the observation met the expectation.
    pub fn handle_type_check_cache_miss(
        &mut self,
        cache: &CodeCache,
        ic_sites: &mut IcSiteTable,
        function_id: u32,
        site_index: u16,
        observed_tag: u8,
        expected_tag: u8,
    ) -> (usize, bool) {
        let handler = self.make_property_stub(cache, observed_tag as ShapeId, 0);
        let site = ic_sites.site(function_id, site_index, IcSiteKind::TypeCheck);
        let dispatched = site.install(IcEntry {
            key: CacheKey::TypeTag(observed_tag),
            offset: 0,
            handler,
        });
        (dispatched, observed_tag == expected_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::{BytecodeEncoder, Opcode};
    use core_types::Heap;
    use runtime::{IcState, JsObject};

    fn simple_block() -> BytecodeBlock {
        let mut block = BytecodeBlock::new();
        let mut enc = BytecodeEncoder::new();
        enc.emit_number(42.0);
        enc.emit(Opcode::Return, &[]);
        block.code = enc.finish().unwrap();
        block
    }

    fn jit() -> BaselineJit {
        BaselineJit::new(Architecture::X86_64, RuntimeHelpers::stubs(), true)
    }

    #[test]
    fn test_compile_simple_function() {
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let compiled = jit.compile(1, &simple_block(), &cache, &mut sites).unwrap();
        assert_eq!(compiled.function_id, 1);
        assert!(compiled.code_size > 0);
        assert!(compiled.offset_map.as_ref().unwrap().len() == 2);
        assert_eq!(jit.stats().functions_compiled, 1);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let first_entry = jit
            .compile(1, &simple_block(), &cache, &mut sites)
            .unwrap()
            .region
            .entry();
        let second_entry = jit
            .compile(1, &simple_block(), &cache, &mut sites)
            .unwrap()
            .region
            .entry();
        assert_eq!(first_entry, second_entry);
        assert_eq!(jit.stats().functions_compiled, 1);
    }

    #[test]
    fn test_ic_sites_get_ids_and_handlers() {
        let mut block = simple_block();
        block.add_ic_site(IcSiteKind::Property);
        block.add_ic_site(IcSiteKind::Method);
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let compiled = jit.compile(7, &block, &cache, &mut sites).unwrap();
        assert_eq!(compiled.ic_site_ids, vec![70000, 70001]);
        let site = sites.existing(7, 0).unwrap();
        assert_eq!(site.miss_handler, RuntimeHelpers::stubs().property_miss);
        let method_site = sites.existing(7, 1).unwrap();
        assert_eq!(method_site.miss_handler, RuntimeHelpers::stubs().method_miss);
    }

    #[test]
    fn test_property_miss_installs_entry() {
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let heap = Heap::new();
        let mut shapes = ShapeRegistry::new();
        let mut objects = ObjectHeap::new();
        let name = heap.strings.intern("x");
        let object = objects.alloc(JsObject::plain(shapes.root()));
        objects.set_property(&mut shapes, object, name, Value::int32(1));

        let handler = jit.handle_property_cache_miss(
            &cache,
            &mut sites,
            3,
            0,
            &shapes,
            &objects,
            Value::object(object),
            name,
        );
        assert_ne!(handler, RuntimeHelpers::stubs().generic_property);
        let site = sites.existing(3, 0).unwrap();
        assert!(matches!(site.state, IcState::Monomorphic(_)));
    }

    #[test]
    fn test_property_miss_on_primitive_routes_generic() {
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let heap = Heap::new();
        let shapes = ShapeRegistry::new();
        let objects = ObjectHeap::new();
        let name = heap.strings.intern("x");
        let handler = jit.handle_property_cache_miss(
            &cache,
            &mut sites,
            3,
            0,
            &shapes,
            &objects,
            Value::int32(5),
            name,
        );
        assert_eq!(handler, RuntimeHelpers::stubs().generic_property);
    }

    #[test]
    fn test_method_miss_requires_callable() {
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let heap = Heap::new();
        let mut shapes = ShapeRegistry::new();
        let mut objects = ObjectHeap::new();
        let name = heap.strings.intern("m");
        let object = objects.alloc(JsObject::plain(shapes.root()));
        objects.set_property(&mut shapes, object, name, Value::int32(1));
        let handler = jit.handle_method_cache_miss(
            &cache,
            &mut sites,
            3,
            0,
            &shapes,
            &objects,
            Value::object(object),
            name,
        );
        // A non-callable slot never earns a specialized method handler
        assert_eq!(handler, RuntimeHelpers::stubs().generic_property);
    }

    #[test]
    fn test_type_check_miss_reports_match() {
        let cache = CodeCache::new(1 << 20);
        let mut sites = IcSiteTable::new();
        let mut jit = jit();
        let (_, matched) =
            jit.handle_type_check_cache_miss(&cache, &mut sites, 2, 0, 4, 4);
        assert!(matched);
        let (_, matched) =
            jit.handle_type_check_cache_miss(&cache, &mut sites, 2, 0, 5, 4);
        assert!(!matched);
    }
}

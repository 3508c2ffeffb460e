//! The compile pipeline orchestrator.
//!
//! A [`Compiler`] runs one unit from request to installed code: body
//! generation through a [`Builder`](crate::jit::builder::Builder),
//! structural cleanup and verification, the optimizer pipeline, backend
//! lowering, and the compare-and-install handshake against the target
//! method. One instance serves one request; the engine hands out a fresh
//! one per compile.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::jit::backend::CodegenBackend;
use crate::jit::builder::builder_for;
use crate::jit::code::{GeneratedCode, RuntimeDataHolder};
use crate::jit::engine::JitConfig;
use crate::jit::ir::{sweep_dead_blocks, verify_function, IrFunction, VerifyError};
use crate::jit::opt::Optimizer;
use crate::jit::queue::{BackgroundCompileRequest, RequestTarget};
use crate::jit::unit::{CompileUnit, Context, UnitState};
use crate::memory::{ClassId, ResourceManager};
use crate::method::{Block, CompiledMethod, InstallOutcome};

/// Drives one compilation from bytecode to installed native code.
pub struct Compiler {
    backend: Arc<dyn CodegenBackend>,
    optimizer: Arc<Optimizer>,
    resources: Arc<ResourceManager>,
    config: JitConfig,
    trace: bool,
    ctx: Context,
    unit: Option<CompileUnit>,
    installed: Option<Arc<RuntimeDataHolder>>,
}

impl Compiler {
    /// A compiler wired to the engine's backend, passes, and resources.
    pub fn new(
        backend: Arc<dyn CodegenBackend>,
        optimizer: Arc<Optimizer>,
        resources: Arc<ResourceManager>,
        config: JitConfig,
    ) -> Self {
        let trace = config.emit_compile_trace;
        Compiler {
            backend,
            optimizer,
            resources,
            config,
            trace,
            ctx: Context::new(),
            unit: None,
            installed: None,
        }
    }

    /// Runs the body-generation phase for a queued request.
    pub fn compile(&mut self, request: &BackgroundCompileRequest) {
        self.trace = self.config.emit_compile_trace || request.debug();
        match request.target() {
            RequestTarget::Method(method) => {
                self.compile_method(method, request.specialization())
            }
            RequestTarget::Block { enclosing, block } => self.compile_block(enclosing, block),
        }
    }

    /// Builds the IR body for `method`, optionally specialized to a
    /// receiver class. The method itself is untouched until
    /// [`generate_function`](Compiler::generate_function) installs a
    /// winner.
    pub fn compile_method(
        &mut self,
        method: &Arc<CompiledMethod>,
        specialization: Option<ClassId>,
    ) {
        self.installed = None;
        self.ctx = Context::new();
        if self.trace {
            eprintln!(
                "jit: compiling {} ({}:{}) ({})",
                method.name(),
                method.file(),
                method.start_line(),
                timestamp()
            );
        }
        let unit = CompileUnit::for_method(Arc::clone(method), specialization);
        self.compile_builder(unit);
    }

    /// Builds the IR body for `block` nested in `method`. A block whose
    /// parent link is missing is loader garbage; it is refused here,
    /// before any IR exists.
    pub fn compile_block(&mut self, method: &Arc<CompiledMethod>, block: &Arc<Block>) {
        self.installed = None;
        self.ctx = Context::new();
        if self.trace {
            eprintln!(
                "jit: compiling block in {} near {}:{} ({})",
                method.name(),
                method.file(),
                method.start_line(),
                timestamp()
            );
        }
        let mut unit = CompileUnit::for_block(Arc::clone(block), Arc::clone(method));
        if block.parent().is_none() {
            if self.trace {
                eprintln!("jit: aborting {}: block has no parent", unit.name());
            }
            unit.mark_unsupported();
            self.unit = Some(unit);
            return;
        }
        self.compile_builder(unit);
    }

    /// Shared driver: run the three builder phases against `unit`. An
    /// unsupported body aborts quietly and the target stays interpreted.
    fn compile_builder(&mut self, mut unit: CompileUnit) {
        self.ctx.set_root(&unit);
        let supported = {
            let mut builder = builder_for(&mut unit, &mut self.ctx);
            builder.setup();
            let ok = builder.generate_body();
            if ok {
                builder.generate_hard_return();
            }
            ok
        };
        if supported {
            unit.mark_body_built();
        } else {
            if self.trace {
                eprintln!("jit: aborting {}: unsupported bytecode", unit.name());
            }
            unit.mark_unsupported();
        }
        self.unit = Some(unit);
    }

    /// Turns the built body into installed machine code and returns its
    /// entry address.
    ///
    /// Idempotent: once this compiler holds finished code, the address is
    /// returned without re-running codegen. With `maybe_concurrent` the
    /// IR-only stretch runs GC-independent, since nothing in it is
    /// collector-visible; the guard is released before the holder with its
    /// heap references is created.
    pub fn generate_function(&mut self, maybe_concurrent: bool) -> Option<*const u8> {
        if let Some(holder) = &self.installed {
            return Some(holder.address());
        }
        let unit = self.unit.as_mut()?;
        if unit.state() != UnitState::BodyBuilt {
            return None;
        }

        let machine = {
            let _gc = maybe_concurrent.then(|| self.resources.gc_independent());

            let report = sweep_dead_blocks(unit.function_mut());
            let errors = verify_function(unit.function());
            if report.is_broken() || !errors.is_empty() {
                dump_defect(unit.function(), &errors);
                unit.mark_broken();
                unit.function_mut().release_body();
                return None;
            }
            unit.mark_verified();

            if self.config.emit_raw_ir {
                eprintln!("[[[ jit raw ir: {} ]]]", unit.name());
                eprintln!("{}", unit.function());
            }
            self.optimizer.optimize(unit.function_mut());
            if self.config.emit_optimized_ir {
                eprintln!("[[[ jit optimized ir: {} ]]]", unit.name());
                eprintln!("{}", unit.function());
            }

            let machine = match self.backend.lower(unit.function()) {
                Ok(machine) => machine,
                Err(err) => {
                    // Same contract as a verifier failure: an internal
                    // defect confined to this unit.
                    eprintln!(
                        "jit: internal error: codegen failed for {}: {}",
                        unit.name(),
                        err
                    );
                    eprintln!("{}", unit.function());
                    unit.mark_broken();
                    unit.function_mut().release_body();
                    return None;
                }
            };

            self.resources.add_code_bytes(machine.size());
            if !self.config.retain_ir {
                unit.function_mut().release_body();
            }
            machine
        };
        unit.mark_code_ready();

        let references = self.ctx.take_constants();
        let candidate = Arc::new(RuntimeDataHolder::new(
            references,
            GeneratedCode::new(machine),
        ));

        let outcome = unit
            .install_method()
            .install_code(unit.specialization(), Arc::clone(&candidate));
        let active = match outcome {
            InstallOutcome::Installed(installed) => {
                self.resources.add_code_resource(Arc::clone(&installed));
                unit.mark_active();
                installed
            }
            // Another compile won the slot; our candidate drops with this
            // scope and the winner's code is adopted as our result.
            InstallOutcome::AlreadyActive(winner) => winner,
        };

        if self.config.emit_disassembly {
            show_code(unit.name(), active.code());
        }
        self.installed = Some(Arc::clone(&active));
        Some(active.address())
    }

    /// Entry address of the finished code, if generation succeeded.
    pub fn function_pointer(&self) -> Option<*const u8> {
        self.installed.as_ref().map(|holder| holder.address())
    }

    /// Dumps the finished machine code to stderr.
    pub fn show_machine_code(&self) {
        if let (Some(unit), Some(holder)) = (&self.unit, &self.installed) {
            show_code(unit.name(), holder.code());
        }
    }

    /// The unit this compiler worked, once a `compile_*` entry has run.
    pub fn unit(&self) -> Option<&CompileUnit> {
        self.unit.as_ref()
    }

    /// Mutable access to the unit, for diagnostic tooling.
    pub fn unit_mut(&mut self) -> Option<&mut CompileUnit> {
        self.unit.as_mut()
    }
}

fn dump_defect(func: &IrFunction, errors: &[VerifyError]) {
    eprintln!("jit: internal error: broken function for {}", func.name);
    for err in errors {
        eprintln!("jit:   {}", err);
    }
    eprintln!("{}", func);
}

fn show_code(name: &str, code: &GeneratedCode) {
    eprintln!("[[[ jit machine code: {} ]]]", name);
    eprint!("{}", code.hex_dump());
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Literal, MethodBody, Op};
    use crate::jit::backend::{CodegenError, MachineCode, StubBackend};
    use crate::jit::code::CodeState;
    use crate::jit::ir::Terminator;
    use crate::memory::ObjectRef;

    fn method_named(name: &str, ops: Vec<Op>) -> Arc<CompiledMethod> {
        CompiledMethod::new(name, "demo.em", 3, MethodBody::new(ops))
    }

    fn return_int(name: &str, value: i64) -> Arc<CompiledMethod> {
        method_named(name, vec![Op::PushInt(value), Op::Return])
    }

    fn compiler_with_config(
        config: JitConfig,
    ) -> (Compiler, Arc<StubBackend>, Arc<ResourceManager>) {
        let backend = Arc::new(StubBackend::new());
        let resources = Arc::new(ResourceManager::new());
        let compiler = Compiler::new(
            Arc::clone(&backend) as Arc<dyn CodegenBackend>,
            Arc::new(Optimizer::new()),
            Arc::clone(&resources),
            config,
        );
        (compiler, backend, resources)
    }

    fn test_compiler() -> (Compiler, Arc<StubBackend>, Arc<ResourceManager>) {
        compiler_with_config(JitConfig::default())
    }

    #[test]
    fn test_compile_method_installs_code() {
        let (mut compiler, _backend, resources) = test_compiler();
        let method = return_int("Point#origin", 7);
        compiler.compile_method(&method, None);
        let address = compiler.generate_function(false).expect("code");
        assert_eq!(method.entry_address(None), Some(address));
        assert_eq!(compiler.function_pointer(), Some(address));
        assert_eq!(compiler.unit().unwrap().state(), UnitState::Active);
        assert_eq!(resources.code().len(), 1);
        let holder = method.code_for(None).expect("holder");
        assert_eq!(holder.code().state(), CodeState::Active);
        assert_eq!(resources.code_bytes(), holder.size());
    }

    #[test]
    fn test_generate_function_is_idempotent() {
        let (mut compiler, backend, _resources) = test_compiler();
        let method = return_int("Point#x", 1);
        compiler.compile_method(&method, None);
        let first = compiler.generate_function(false).expect("code");
        let second = compiler.generate_function(false).expect("code");
        assert_eq!(first, second);
        assert_eq!(backend.lower_count(), 1);
    }

    #[test]
    fn test_unsupported_body_stays_interpreted() {
        let (mut compiler, backend, resources) = test_compiler();
        let method = method_named(
            "Point#greet",
            vec![
                Op::PushSelf,
                Op::Send {
                    selector: 0,
                    argc: 0,
                },
                Op::Return,
            ],
        );
        compiler.compile_method(&method, None);
        assert_eq!(compiler.unit().unwrap().state(), UnitState::Unsupported);
        assert_eq!(compiler.generate_function(false), None);
        assert_eq!(compiler.function_pointer(), None);
        assert_eq!(method.entry_address(None), None);
        assert!(resources.code().is_empty());
        assert_eq!(backend.lower_count(), 0);
    }

    #[test]
    fn test_parentless_block_rejected_before_codegen() {
        let (mut compiler, backend, resources) = test_compiler();
        let enclosing = return_int("Array#each", 0);
        let block_method = method_named("Array#each.block", vec![Op::PushInt(1), Op::Return]);
        let block = Block::detached(block_method);
        compiler.compile_block(&enclosing, &block);
        let unit = compiler.unit().expect("unit");
        assert_eq!(unit.state(), UnitState::Unsupported);
        assert!(unit.function().blocks.is_empty());
        assert_eq!(compiler.generate_function(true), None);
        assert!(resources.code().is_empty());
        assert_eq!(backend.lower_count(), 0);
        assert_eq!(resources.gc().enters(), 0);
    }

    #[test]
    fn test_block_installs_on_its_own_method() {
        let (mut compiler, _backend, _resources) = test_compiler();
        let enclosing = return_int("Array#each", 0);
        let block_method = method_named("Array#each.block", vec![Op::PushField(0), Op::Return]);
        let block = Block::new(Arc::clone(&block_method), Arc::clone(enclosing.body()));
        compiler.compile_block(&enclosing, &block);
        let address = compiler.generate_function(false).expect("code");
        assert_eq!(block_method.entry_address(None), Some(address));
        assert_eq!(enclosing.entry_address(None), None);
        assert_eq!(compiler.unit().unwrap().name(), "block in Array#each");
    }

    #[test]
    fn test_broken_function_dumped_and_dropped() {
        let (mut compiler, backend, resources) = test_compiler();
        let method = return_int("Point#bad", 9);
        compiler.compile_method(&method, None);
        {
            let func = compiler.unit_mut().expect("unit").function_mut();
            let pad = func.blocks.last_mut().expect("blocks");
            pad.terminator = Terminator::None;
        }
        assert_eq!(compiler.generate_function(true), None);
        let unit = compiler.unit().expect("unit");
        assert_eq!(unit.state(), UnitState::Broken);
        assert!(unit.function().is_released());
        assert_eq!(method.entry_address(None), None);
        assert!(resources.code().is_empty());
        assert_eq!(backend.lower_count(), 0);
        assert_eq!(resources.gc().enters(), 1);
        assert_eq!(resources.gc().exits(), 1);
    }

    #[test]
    fn test_dead_scaffold_is_cleaned_not_fatal() {
        let (mut compiler, _backend, _resources) = test_compiler();
        let method = return_int("Point#tidy", 4);
        compiler.compile_method(&method, None);
        // An abandoned translation path can leave an empty block behind;
        // cleanup removes it rather than failing verification.
        compiler.unit_mut().expect("unit").function_mut().add_block();
        let address = compiler.generate_function(false);
        assert!(address.is_some());
        assert_eq!(method.specialization_count(), 1);
        assert_eq!(compiler.unit().unwrap().state(), UnitState::Active);
    }

    #[test]
    fn test_gc_independence_balances_on_success() {
        let (mut compiler, _backend, resources) = test_compiler();
        compiler.compile_method(&return_int("Point#fast", 2), None);
        assert!(compiler.generate_function(true).is_some());
        assert_eq!(resources.gc().enters(), 1);
        assert_eq!(resources.gc().exits(), 1);
        assert_eq!(resources.gc().independent_threads(), 0);

        let (mut compiler, _backend, resources) = test_compiler();
        compiler.compile_method(&return_int("Point#slow", 2), None);
        assert!(compiler.generate_function(false).is_some());
        assert_eq!(resources.gc().enters(), 0);
        assert_eq!(resources.gc().exits(), 0);
    }

    #[test]
    fn test_code_size_accumulates_across_units() {
        let (_, _, resources) = test_compiler();
        let methods = [
            return_int("A#a", 1),
            method_named("A#b", vec![Op::PushInt(1), Op::PushInt(2), Op::Add, Op::Return]),
            method_named(
                "A#c",
                vec![
                    Op::PushInt(5),
                    Op::PushInt(10),
                    Op::Cmp(crate::bytecode::CmpOp::Lt),
                    Op::Return,
                ],
            ),
        ];
        let mut expected = 0;
        for method in &methods {
            let mut compiler = Compiler::new(
                Arc::new(StubBackend::new()),
                Arc::new(Optimizer::new()),
                Arc::clone(&resources),
                JitConfig::default(),
            );
            compiler.compile_method(method, None);
            assert!(compiler.generate_function(false).is_some());
            expected += method.code_for(None).expect("holder").size();
        }
        assert_eq!(resources.code_bytes(), expected);
        assert_eq!(resources.code().len(), 3);
    }

    #[test]
    fn test_losing_install_adopts_winner() {
        let resources = Arc::new(ResourceManager::new());
        let backend = Arc::new(StubBackend::new());
        let optimizer = Arc::new(Optimizer::new());
        let method = return_int("Point#hot", 5);

        let mut first = Compiler::new(
            Arc::clone(&backend) as Arc<dyn CodegenBackend>,
            Arc::clone(&optimizer),
            Arc::clone(&resources),
            JitConfig::default(),
        );
        first.compile_method(&method, None);
        let winner = first.generate_function(false).expect("code");

        let mut second = Compiler::new(
            Arc::clone(&backend) as Arc<dyn CodegenBackend>,
            Arc::clone(&optimizer),
            Arc::clone(&resources),
            JitConfig::default(),
        );
        second.compile_method(&method, None);
        let adopted = second.generate_function(false).expect("code");

        assert_eq!(winner, adopted);
        assert_eq!(method.specialization_count(), 1);
        assert_eq!(resources.code().len(), 1);
        assert_eq!(backend.lower_count(), 2);
        // The loser lowered real code, so the counter saw both.
        let size = method.code_for(None).expect("holder").size();
        assert_eq!(resources.code_bytes(), size * 2);
        assert_eq!(first.unit().unwrap().state(), UnitState::Active);
        assert_eq!(second.unit().unwrap().state(), UnitState::CodeReady);
    }

    #[test]
    fn test_specializations_coexist() {
        let resources = Arc::new(ResourceManager::new());
        let method = method_named("Point#x", vec![Op::PushField(0), Op::Return]);

        let mut specialized = Compiler::new(
            Arc::new(StubBackend::new()),
            Arc::new(Optimizer::new()),
            Arc::clone(&resources),
            JitConfig::default(),
        );
        specialized.compile_method(&method, Some(ClassId(9)));
        let fast = specialized.generate_function(false).expect("code");

        let mut generic = Compiler::new(
            Arc::new(StubBackend::new()),
            Arc::new(Optimizer::new()),
            Arc::clone(&resources),
            JitConfig::default(),
        );
        generic.compile_method(&method, None);
        let slow = generic.generate_function(false).expect("code");

        assert_ne!(fast, slow);
        assert_eq!(method.specialization_count(), 2);
        assert_eq!(method.entry_address(Some(ClassId(9))), Some(fast));
        assert_eq!(method.entry_address(None), Some(slow));
        assert_eq!(resources.code().len(), 2);
    }

    #[test]
    fn test_retain_ir_keeps_the_body() {
        let config = JitConfig {
            retain_ir: true,
            ..JitConfig::default()
        };
        let (mut compiler, _backend, _resources) = compiler_with_config(config);
        compiler.compile_method(&return_int("Point#kept", 1), None);
        assert!(compiler.generate_function(false).is_some());
        assert!(!compiler.unit().unwrap().function().is_released());

        let (mut compiler, _backend, _resources) = test_compiler();
        compiler.compile_method(&return_int("Point#dropped", 1), None);
        assert!(compiler.generate_function(false).is_some());
        assert!(compiler.unit().unwrap().function().is_released());
    }

    #[test]
    fn test_backend_failure_is_confined() {
        struct FailingBackend;
        impl CodegenBackend for FailingBackend {
            fn name(&self) -> &str {
                "failing"
            }
            fn lower(&self, _func: &IrFunction) -> Result<MachineCode, CodegenError> {
                Err(CodegenError::Backend("out of branch range".into()))
            }
        }

        let resources = Arc::new(ResourceManager::new());
        let mut compiler = Compiler::new(
            Arc::new(FailingBackend),
            Arc::new(Optimizer::new()),
            Arc::clone(&resources),
            JitConfig::default(),
        );
        let method = return_int("Point#doomed", 3);
        compiler.compile_method(&method, None);
        assert_eq!(compiler.generate_function(true), None);
        assert_eq!(compiler.unit().unwrap().state(), UnitState::Broken);
        assert_eq!(method.entry_address(None), None);
        assert!(resources.code().is_empty());
        assert_eq!(resources.gc().enters(), resources.gc().exits());
    }

    #[test]
    fn test_object_constants_flow_into_holder() {
        let (mut compiler, _backend, _resources) = test_compiler();
        let mut body = MethodBody::new(vec![Op::PushLiteral(0), Op::Return]);
        body.literals = vec![Literal::Object(ObjectRef(0xabc))];
        let method = CompiledMethod::new("Point#unit_x", "demo.em", 12, body);
        compiler.compile_method(&method, None);
        assert!(compiler.generate_function(false).is_some());
        let holder = method.code_for(None).expect("holder");
        assert_eq!(holder.references(), &[ObjectRef(0xabc)]);
    }

    #[test]
    fn test_diagnostics_do_not_disturb_the_compile() {
        let config = JitConfig {
            emit_raw_ir: true,
            emit_optimized_ir: true,
            emit_disassembly: true,
            emit_compile_trace: true,
            ..JitConfig::default()
        };
        let (mut compiler, _backend, _resources) = compiler_with_config(config);
        let method = return_int("Point#loud", 6);
        compiler.compile_method(&method, None);
        assert!(compiler.generate_function(false).is_some());
        compiler.show_machine_code();
        assert_eq!(method.specialization_count(), 1);
    }
}

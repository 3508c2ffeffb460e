//! Background compile requests and the worker pool that drains them.
//!
//! A request is an immutable description of one compile target. An
//! external hotness policy enqueues them; `ember-jit-{i}` workers block on
//! the channel and run each request through a fresh
//! [`Compiler`](crate::jit::Compiler) to a terminal outcome. Duplicate
//! requests for one target are allowed; the install handshake keeps the
//! first winner and later results are discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::jit::engine::JitEngine;
use crate::memory::ClassId;
use crate::method::{Block, CompiledMethod};

/// What a request compiles.
pub enum RequestTarget {
    /// A whole method body.
    Method(Arc<CompiledMethod>),
    /// A block nested in `enclosing`.
    Block {
        /// The lexically enclosing method.
        enclosing: Arc<CompiledMethod>,
        /// The block itself.
        block: Arc<Block>,
    },
}

/// An immutable unit of queued compile work.
pub struct BackgroundCompileRequest {
    target: RequestTarget,
    specialization: Option<ClassId>,
    debug: bool,
}

impl BackgroundCompileRequest {
    /// A request to compile `method`, optionally specialized to a
    /// receiver class.
    pub fn method(method: Arc<CompiledMethod>, specialization: Option<ClassId>) -> Self {
        BackgroundCompileRequest {
            target: RequestTarget::Method(method),
            specialization,
            debug: false,
        }
    }

    /// A request to compile `block` nested in `enclosing`.
    pub fn block(enclosing: Arc<CompiledMethod>, block: Arc<Block>) -> Self {
        BackgroundCompileRequest {
            target: RequestTarget::Block { enclosing, block },
            specialization: None,
            debug: false,
        }
    }

    /// Forces the compile trace for this request alone.
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// The compile target.
    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    /// Receiver-class specialization, if the policy asked for one.
    pub fn specialization(&self) -> Option<ClassId> {
        self.specialization
    }

    /// True when this request forces the compile trace.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Display name of the target.
    pub fn name(&self) -> &str {
        match &self.target {
            RequestTarget::Method(method) => method.name(),
            RequestTarget::Block { block, .. } => block.method().name(),
        }
    }
}

/// Runs one request to completion on the calling thread.
///
/// Used by eager-compile paths that cannot wait for the pool; the install
/// handshake makes it safe to race against queued work for the same
/// target.
pub fn compile_request(
    engine: &JitEngine,
    request: &BackgroundCompileRequest,
) -> Option<*const u8> {
    let mut compiler = engine.compiler();
    compiler.compile(request);
    compiler.generate_function(true)
}

/// The background worker pool.
///
/// Workers own nothing but a channel endpoint and the engine handle, so a
/// stale request after an invalidation simply runs to completion and loses
/// the install race. There is no cancellation.
pub struct BackgroundCompiler {
    sender: Option<Sender<BackgroundCompileRequest>>,
    workers: Vec<JoinHandle<()>>,
    processed: Arc<AtomicUsize>,
}

impl BackgroundCompiler {
    /// Spawns the pool against `engine`, sized by the engine's config.
    pub fn start(engine: Arc<JitEngine>) -> Self {
        let (sender, receiver) = channel::unbounded::<BackgroundCompileRequest>();
        let processed = Arc::new(AtomicUsize::new(0));
        let count = engine.config().worker_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let receiver = receiver.clone();
            let engine = Arc::clone(&engine);
            let processed = Arc::clone(&processed);
            let handle = thread::Builder::new()
                .name(format!("ember-jit-{}", i))
                .spawn(move || {
                    while let Ok(request) = receiver.recv() {
                        let _ = compile_request(&engine, &request);
                        processed.fetch_add(1, Ordering::Release);
                    }
                })
                .expect("Failed to spawn JIT worker thread");
            workers.push(handle);
        }
        BackgroundCompiler {
            sender: Some(sender),
            workers,
            processed,
        }
    }

    /// Enqueues a request. Silently dropped after shutdown.
    pub fn schedule(&self, request: BackgroundCompileRequest) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(request);
        }
    }

    /// Requests run to a terminal outcome so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue, drains what is already enqueued, and joins the
    /// workers.
    pub fn shutdown(&mut self) {
        // Dropping the sender closes the channel; workers finish the
        // backlog and fall out of their recv loop.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{MethodBody, Op};
    use crate::jit::backend::StubBackend;

    fn method_named(name: &str, ops: Vec<Op>) -> Arc<CompiledMethod> {
        CompiledMethod::new(name, "demo.em", 1, MethodBody::new(ops))
    }

    #[test]
    fn test_method_request_carries_specialization() {
        let method = method_named("Point#x", vec![Op::PushInt(1), Op::Return]);
        let request = BackgroundCompileRequest::method(Arc::clone(&method), Some(ClassId(4)));
        assert_eq!(request.specialization(), Some(ClassId(4)));
        assert!(!request.debug());
        assert_eq!(request.name(), "Point#x");
        assert!(matches!(request.target(), RequestTarget::Method(_)));
    }

    #[test]
    fn test_block_request_is_never_specialized() {
        let enclosing = method_named("Array#each", vec![Op::PushInt(0), Op::Return]);
        let body = method_named("Array#each.block", vec![Op::PushInt(1), Op::Return]);
        let block = Block::new(Arc::clone(&body), Arc::clone(enclosing.body()));
        let request = BackgroundCompileRequest::block(enclosing, block).with_debug();
        assert_eq!(request.specialization(), None);
        assert!(request.debug());
        assert!(matches!(request.target(), RequestTarget::Block { .. }));
    }

    #[test]
    fn test_compile_request_runs_to_completion() {
        let engine = JitEngine::new(Arc::new(StubBackend::new()));
        let method = method_named("Point#y", vec![Op::PushInt(2), Op::Return]);
        let request = BackgroundCompileRequest::method(Arc::clone(&method), None);
        let address = compile_request(&engine, &request).expect("code");
        assert_eq!(method.entry_address(None), Some(address));
        assert_eq!(engine.resources().code().len(), 1);
        assert_eq!(engine.resources().gc().enters(), 1);
        assert_eq!(engine.resources().gc().exits(), 1);
    }
}

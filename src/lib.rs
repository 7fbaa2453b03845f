use log::debug;
use rayon::Scope;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::deob::DeobfuscatedUnit;
use crate::error::Error;
use crate::pass::{PassEngine, DEFAULT_ITERATION_CAP};
use crate::unit::CompiledUnit;

/// Disassembly and assembly of method bytecode
pub mod bytecode;
/// Raw class-file structure
pub mod classfile;
/// Removal of junk members obfuscators leave behind
pub mod cleanup;
/// Representing code as a graph of basic blocks
pub mod code_graph;
/// Instruction lists with stable handles, exception ranges and flow index
pub mod code;
/// Constant pool reading, writing and interning
pub mod constant_pool;
/// Jar and class file input and output
pub mod container;
/// Per-unit deobfuscation driver
pub mod deob;
/// Field and method descriptors
pub mod descriptor;
/// Errors
pub mod error;
/// Exception-based control-flow restoration
pub mod exceptions;
/// Obfuscator family detectors and pipelines
pub mod families;
/// Jump chains and dead code
pub mod flow;
/// Constant folding and constant branch elimination
pub mod fold;
/// Rewriting `invokedynamic` sites into direct calls
pub mod indy;
/// Junk field initialisation and constructor allocations
pub mod initializers;
/// Typed instructions
pub mod insn;
/// Whole-job orchestration and the completion flag
pub mod job;
/// Java string values and modified UTF-8
pub mod mutf8;
/// JVM opcode table
pub mod opcodes;
/// Pass traits, pipelines and the fixed-point engine
pub mod pass;
/// Constant evaluation with JVM arithmetic semantics
pub mod smallvm;
/// String decryption recipes and the decryption pass
pub mod strings;
/// Compiled units: classes as passes see them
pub mod unit;

pub struct Deobfuscator {
    engine: PassEngine,
    enable_graphs: bool,
    files_processed: AtomicUsize,
}

impl Default for Deobfuscator {
    fn default() -> Self {
        Deobfuscator::new()
    }
}

impl Deobfuscator {
    /// Creates a new instance of a deobfuscator running the standard engine
    pub fn new() -> Deobfuscator {
        Deobfuscator::with_engine(PassEngine::standard(DEFAULT_ITERATION_CAP))
    }

    pub fn with_engine(engine: PassEngine) -> Deobfuscator {
        Deobfuscator {
            engine,
            enable_graphs: false,
            files_processed: AtomicUsize::new(0),
        }
    }

    /// Consumes the current Deobfuscator object and returns a new one with graph
    /// output enabled.
    pub fn enable_graphs(mut self) -> Deobfuscator {
        self.enable_graphs = true;
        self
    }

    /// Rebuilds the standard engine with a different fixed-point cap.
    pub fn iteration_cap(mut self, cap: usize) -> Deobfuscator {
        self.engine = PassEngine::standard(cap);
        self
    }

    pub fn engine(&self) -> &PassEngine {
        &self.engine
    }

    fn next_file_number(&self) -> usize {
        self.files_processed.fetch_add(1, Ordering::Relaxed)
    }

    /// Deobfuscates a single serialized compiled unit.
    pub fn deobfuscate_one(&self, data: &[u8]) -> Result<DeobfuscatedUnit, Error> {
        crate::deob::deobfuscate_unit(data, &self.engine, self.next_file_number(), self.enable_graphs)
    }

    pub(crate) fn deobfuscate_parsed(&self, unit: CompiledUnit, original: &[u8]) -> Result<DeobfuscatedUnit, Error> {
        crate::deob::deobfuscate_parsed(unit, original, &self.engine, self.next_file_number(), self.enable_graphs)
    }

    /// Deobfuscates every unit on the rayon pool. Results come back in
    /// input order, each paired with the name it was given under.
    pub fn deobfuscate_all(&self, units: &[(String, Vec<u8>)]) -> Vec<(String, Result<DeobfuscatedUnit, Error>)> {
        let out_results = Arc::new(Mutex::new(Vec::with_capacity(units.len())));
        rayon::scope(|scope| {
            for (index, (name, data)) in units.iter().enumerate() {
                self.spawn_unit(scope, index, name, data, Arc::clone(&out_results));
            }
        });

        let mut results = match Arc::try_unwrap(out_results) {
            Ok(results) => results.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => std::mem::take(&mut *shared.lock().unwrap_or_else(PoisonError::into_inner)),
        };
        results.sort_by_key(|(index, _, _)| *index);
        results.into_iter().map(|(_, name, result)| (name, result)).collect()
    }

    fn spawn_unit<'s>(
        &'s self,
        scope: &Scope<'s>,
        index: usize,
        name: &'s str,
        data: &'s [u8],
        out_results: Arc<Mutex<Vec<(usize, String, Result<DeobfuscatedUnit, Error>)>>>,
    ) {
        scope.spawn(move |_scope| {
            debug!("processing {}", name);
            let result = self.deobfuscate_one(data);
            out_results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((index, name.to_string(), result));
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Installs a trace logger once; later calls are no-ops.
    pub(crate) fn init_logging() {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Trace)
            .init();
    }
}

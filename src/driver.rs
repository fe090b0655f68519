//! Ties every phase together: validate → map → lex/parse → analyze →
//! per-function codegen → link → flip → run.
//!
//! Grounded in `original_source/srcs/main.c`'s phase sequence (`compile_ctx_add_file`,
//! `compile_parse_all`, `compile_analyze_all`, `jit_compile_pass`,
//! `jit_link_all`, `arena_set_prot`, then scanning the function registry
//! for `main`) and `incs/validation.h`/`incs/file_map.h` for the
//! validate-then-mmap steps this module's `map_source_file` mirrors.

use std::fs::File;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::arena::ExecutableArena;
use crate::codegen;
use crate::diag::Sink;
use crate::front::{self, ast::TranslationUnit};
use crate::ir;
use crate::link;
use crate::sema;

const MAX_SOURCE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0:?} does not have a .c extension")]
    WrongExtension(PathBuf),
    #[error("{0:?} is not a regular file")]
    NotARegularFile(PathBuf),
    #[error("{0:?} is {1} bytes, over the {} MiB limit", MAX_SOURCE_SIZE / 1024 / 1024)]
    TooLarge(PathBuf, u64),
    #[error("failed to open {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("compilation failed with {0} error(s); see diagnostics above")]
    CompilationFailed(usize),
    #[error("no 'main' function found")]
    NoMain,
    #[error("linking failed")]
    LinkFailed,
    #[error("failed to prepare executable memory: {0}")]
    Arena(#[source] std::io::Error),
}

/// A source file `mmap`'d read-only for the duration of lexing and
/// parsing. `Drop` unmaps it, mirroring the original's resource tracker
/// unmapping every mapped file on the way out regardless of outcome.
struct MappedSource {
    map: memmap2::Mmap,
    path: PathBuf,
}

impl MappedSource {
    fn text(&self) -> &str {
        std::str::from_utf8(&self.map).unwrap_or("")
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

fn validate_and_map(path: &Path) -> Result<MappedSource, DriverError> {
    if path.extension().and_then(|e| e.to_str()) != Some("c") {
        return Err(DriverError::WrongExtension(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|e| DriverError::Io(path.to_path_buf(), e))?;
    let metadata = file.metadata().map_err(|e| DriverError::Io(path.to_path_buf(), e))?;
    if !metadata.is_file() {
        return Err(DriverError::NotARegularFile(path.to_path_buf()));
    }
    if metadata.len() > MAX_SOURCE_SIZE {
        return Err(DriverError::TooLarge(path.to_path_buf(), metadata.len()));
    }
    // SAFETY: the file is opened read-only above and not modified by this
    // process while the mapping lives; a third party truncating it
    // concurrently is the same hazard every `mmap`-based reader accepts.
    let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| DriverError::Io(path.to_path_buf(), e))?;
    Ok(MappedSource { map, path: path.to_path_buf() })
}

/// Run the whole pipeline and return the compiled program's exit code.
pub fn compile_and_run(paths: &[PathBuf]) -> Result<i64, DriverError> {
    let mapped: Vec<MappedSource> = {
        let _span = info_span!("validate_and_map").entered();
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push(validate_and_map(path)?);
        }
        out
    };

    let mut sink = Sink::new();
    let mut unit = TranslationUnit::default();
    {
        let _span = info_span!("lex_and_parse").entered();
        for source in &mapped {
            let name = source.name();
            let tokens = front::lex::Lexer::new(source.text(), &name).tokenize(&mut sink);
            let mut parsed = front::parse(&tokens, &name, &mut sink);
            unit.functions.append(&mut parsed.functions);
        }
        if sink.has_errors() {
            sink.print_all();
            return Err(DriverError::CompilationFailed(sink.error_count()));
        }
    }
    info!(functions = unit.functions.len(), "parsed");

    {
        let _span = info_span!("analyze").entered();
        sema::analyze(&mut unit, "<translation unit>", &mut sink);
        if sink.has_errors() {
            sink.print_all();
            return Err(DriverError::CompilationFailed(sink.error_count()));
        }
    }

    let compiled = {
        let _span = info_span!("codegen").entered();
        let mut compiled = Vec::new();
        for func in &unit.functions {
            if func.is_prototype {
                continue;
            }
            let Some(ir_func) = ir::gen_function(func, "<translation unit>", &mut sink) else {
                warn!(function = %func.name, "function produced no code");
                continue;
            };
            let alloc = codegen::allocate(&ir_func);
            match codegen::build_function(&ir_func, &alloc, func.params.len()) {
                Ok(f) => compiled.push(f),
                Err(e) => {
                    sink.error(crate::diag::Category::Codegen, None, func.line, func.column, e.to_string());
                }
            }
        }
        compiled
    };
    if sink.has_errors() {
        sink.print_all();
        return Err(DriverError::CompilationFailed(sink.error_count()));
    }

    let total_size: usize = compiled.iter().map(|f| f.code.len()).sum();
    let mut arena = ExecutableArena::new(total_size.max(1)).map_err(DriverError::Arena)?;

    let (code, placed) = {
        let _span = info_span!("link").entered();
        match link::link_all(&compiled, arena.base_addr(), &mut sink) {
            Some(result) => result,
            None => {
                sink.print_all();
                return Err(DriverError::LinkFailed);
            }
        }
    };

    arena.write(&code);
    arena.make_executable().map_err(DriverError::Arena)?;

    let main_fn = placed
        .iter()
        .find(|p| p.name.to_string() == "main")
        .ok_or(DriverError::NoMain)?;

    let _span = info_span!("execute").entered();
    // SAFETY: `main_fn.offset` is a function this same build placed and
    // linked, the arena was just flipped executable above, and `sema`
    // rejected any `main` with parameters `ir::gen` wouldn't have loaded
    // correctly for a zero-argument call.
    let result = unsafe { arena.call_entry(main_fn.offset) };
    Ok(result)
}

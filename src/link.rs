//! Resolves every function's call sites to the final address its callee
//! landed at once all functions have been placed consecutively into the
//! executable arena, and writes those addresses into the
//! `0xDEADBEEFDEADBEEF` placeholders `codegen::builder` left behind.
//!
//! Grounded in `original_source/srcs/jit/jit.c`'s `jit_link_all`, which
//! walks the same kind of call-site list and does the same
//! `memcpy(site->patch_location, &addr, 8)`.

use crate::codegen::CompiledFunction;
use crate::common::Id;
use crate::diag::{Category, Sink};

/// Where one compiled function landed inside the arena, once placed.
#[derive(Clone, Copy)]
pub struct PlacedFunction {
    pub name: Id,
    pub addr: usize,
    pub offset: usize,
    pub size: usize,
}

/// Concatenate every function's code into one buffer and patch every call
/// site to the real address of its callee. Returns the combined code and
/// each function's `(name, offset)` within it, or records a
/// `Category::Codegen` error (call to a name with no compiled body —
/// `sema` should have already ruled this out, so this is a last-resort
/// internal-consistency check) and returns `None`.
pub fn link_all(functions: &[CompiledFunction], base_addr: usize, sink: &mut Sink) -> Option<(Vec<u8>, Vec<PlacedFunction>)> {
    let mut code = Vec::new();
    let mut placed = Vec::with_capacity(functions.len());
    for f in functions {
        let offset = code.len();
        placed.push(PlacedFunction {
            name: f.name,
            addr: base_addr + offset,
            offset,
            size: f.code.len(),
        });
        code.extend_from_slice(&f.code);
    }

    let mut ok = true;
    for f in functions {
        for site in &f.call_sites {
            let Some(callee) = placed.iter().find(|p| p.name == site.target_name) else {
                sink.error(
                    Category::Codegen,
                    None,
                    0,
                    0,
                    format!("call to '{}' has no compiled definition", site.target_name),
                );
                ok = false;
                continue;
            };
            let my_offset = placed.iter().find(|p| p.name == f.name).unwrap().offset;
            let patch_at = my_offset + site.patch_offset;
            code[patch_at..patch_at + 8].copy_from_slice(&(callee.addr as u64).to_le_bytes());
        }
    }

    if ok {
        Some((code, placed))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{self, CallSite};

    fn compiled(name: &str, code: Vec<u8>, call_sites: Vec<CallSite>) -> CompiledFunction {
        codegen::CompiledFunction {
            name: Id::new(name.to_string()),
            code,
            call_sites,
        }
    }

    #[test]
    fn patches_a_call_site_to_the_callees_base_address() {
        let callee = compiled("helper", vec![0xC3], vec![]);
        let mut caller_code = vec![0; 10];
        let placeholder_offset = 2;
        caller_code[placeholder_offset..placeholder_offset + 8].copy_from_slice(&0xDEADBEEFDEADBEEFu64.to_le_bytes());
        let caller = compiled(
            "main",
            caller_code,
            vec![CallSite {
                patch_offset: placeholder_offset,
                target_name: Id::new("helper".to_string()),
            }],
        );

        let mut sink = Sink::new();
        let (code, placed) = link_all(&[caller, callee], 0x1000, &mut sink).unwrap();
        assert!(!sink.has_errors());

        let helper = placed.iter().find(|p| p.name.to_string() == "helper").unwrap();
        let patched = u64::from_le_bytes(code[placeholder_offset..placeholder_offset + 8].try_into().unwrap());
        assert_eq!(patched, helper.addr as u64);
    }

    #[test]
    fn reports_a_call_to_an_undefined_function() {
        let caller = compiled(
            "main",
            vec![0; 10],
            vec![CallSite {
                patch_offset: 0,
                target_name: Id::new("missing".to_string()),
            }],
        );
        let mut sink = Sink::new();
        assert!(link_all(&[caller], 0x1000, &mut sink).is_none());
        assert!(sink.has_errors());
    }
}

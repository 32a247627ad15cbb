// SPDX-License-Identifier: AGPL-3.0-only

//! Program composition and compiled-program handles.
//!
//! Every program a context builds is assembled from the same layers, in
//! this order:
//!
//! ```text
//!   // Compilation Options: <options>      (only when non-empty)
//!   #define <engine defines>
//!   alias real = f32; ...                  (precision type aliases)
//!   <common helper block>
//!   #define <call-site defines>            (engine keys win)
//!   <kernel source>
//! ```
//!
//! The composed text is run through [`Preprocessor`] by the backend, which
//! also indexes the `@compute` entry points.

pub mod preprocess;

pub use preprocess::{Macro, PreprocessError, Preprocessor};

use crate::backend::{ComputeBackend, KernelId, ProgramId};
use crate::error::{ContextError, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// The layers of one program, before composition.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSource<'a> {
    pub options: &'a str,
    pub engine_defines: &'a BTreeMap<String, String>,
    pub type_aliases: &'a str,
    pub common: &'a str,
    pub call_site_defines: &'a BTreeMap<String, String>,
    pub source: &'a str,
}

impl ProgramSource<'_> {
    /// Concatenate the layers into one source text.
    ///
    /// A call-site define whose macro name matches an engine define is
    /// dropped; the engine value is what the kernel sees.
    #[must_use]
    pub fn compose(&self) -> String {
        let mut out = String::new();
        if !self.options.is_empty() {
            let _ = writeln!(out, "// Compilation Options: {}\n", self.options);
        }
        for (key, value) in self.engine_defines {
            push_define(&mut out, key, value);
        }
        out.push('\n');
        out.push_str(self.type_aliases);
        out.push_str(self.common);
        out.push('\n');

        let engine_names: Vec<&str> = self.engine_defines.keys().map(|k| macro_name(k)).collect();
        for (key, value) in self.call_site_defines {
            let name = macro_name(key);
            if engine_names.contains(&name) {
                log::debug!("call-site define {name} shadowed by engine define, skipped");
                continue;
            }
            push_define(&mut out, key, value);
        }
        out.push('\n');
        out.push_str(self.source);
        out
    }
}

fn push_define(out: &mut String, key: &str, value: &str) {
    let value = value.replace('\n', " \\\n");
    let _ = writeln!(out, "#define {key} {value}");
}

/// The macro name of a define key: `"F(a, b)"` → `"F"`.
#[must_use]
pub fn macro_name(key: &str) -> &str {
    key.split('(').next().unwrap_or(key).trim()
}

/// Names of every `@compute` entry point in a WGSL source.
#[must_use]
pub fn entry_points(source: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.find("@compute") {
        rest = &rest[at + "@compute".len()..];
        let mut tokens = rest
            .split(|c: char| c.is_whitespace() || c == '(')
            .filter(|t| !t.is_empty());
        if tokens.any(|t| t == "fn") {
            if let Some(name) = tokens.next() {
                found.push(name.to_string());
            }
        }
    }
    found
}

/// Preprocess a composed source, mapping failures to a compile error.
///
/// # Errors
///
/// [`ContextError::Compile`] carrying the preprocessor diagnostic.
pub fn preprocess(source: &str) -> Result<(String, Preprocessor)> {
    let mut pp = Preprocessor::new();
    let text = pp.process(source).map_err(|e| {
        log::warn!("kernel preprocessing failed: {e}");
        ContextError::Compile { log: e.to_string() }
    })?;
    Ok((text, pp))
}

/// A resolved kernel entry point.
#[derive(Debug, Clone)]
pub struct Kernel {
    id: KernelId,
    name: Arc<str>,
}

impl Kernel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub(crate) const fn id(&self) -> KernelId {
        self.id
    }
}

/// A built program. Programs are not cached; every build compiles.
pub struct CompiledProgram {
    id: ProgramId,
    backend: Arc<dyn ComputeBackend>,
    entry_points: Vec<String>,
}

impl CompiledProgram {
    /// Build a composed source on `backend`.
    ///
    /// # Errors
    ///
    /// [`ContextError::Compile`] with the diagnostic log.
    pub fn build(backend: &Arc<dyn ComputeBackend>, composed: &str, options: &str) -> Result<Self> {
        let (text, _) = preprocess(composed)?;
        let id = backend.build_program(composed, options)?;
        Ok(Self {
            id,
            backend: Arc::clone(backend),
            entry_points: entry_points(&text),
        })
    }

    /// Look up an entry point by name.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if the program has no such entry point.
    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        let id = self.backend.kernel(self.id, name)?;
        Ok(Kernel {
            id,
            name: Arc::from(name),
        })
    }

    #[must_use]
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("id", &self.id)
            .field("entry_points", &self.entry_points)
            .finish_non_exhaustive()
    }
}

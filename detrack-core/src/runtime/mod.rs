//! runtime — ONNX Runtime shared-library discovery

use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
const ORT_LIB: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_LIB: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const ORT_LIB: &str = "libonnxruntime.so";

/// How many parent directories of the executable to search.
const EXE_ANCESTORS: usize = 5;

/// Point `ORT_DYLIB_PATH` at an ONNX Runtime library before any session is
/// built.
///
/// Lookup order:
/// 1) an existing `ORT_DYLIB_PATH` that names a real file
/// 2) `models/onnxruntime*/lib/<lib>` or `models/<lib>` next to the cwd or
///    the executable (and its parents)
///
/// When nothing is found the variable is left alone and ort falls back to
/// the system loader path.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing = PathBuf::from(existing);
        if existing.is_file() {
            tracing::debug!(path = %existing.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing);
        }
        tracing::warn!(
            path = %existing.display(),
            "ORT_DYLIB_PATH does not name a file; searching for {ORT_LIB}"
        );
    }

    let found = search_roots()
        .iter()
        .flat_map(|root| ort_candidates(root))
        .find(|candidate| candidate.is_file());

    match found {
        Some(path) => {
            // SAFETY: called once from the main thread before any ORT session
            // exists, nothing else reads or writes the environment concurrently.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &path);
            }
            tracing::info!(path = %path.display(), "configured ORT_DYLIB_PATH");
            Some(path)
        }
        None => {
            tracing::warn!("{ORT_LIB} not found next to the binary; relying on the system library path");
            None
        }
    }
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe() {
        roots.extend(exe.ancestors().skip(1).take(EXE_ANCESTORS).map(Path::to_path_buf));
    }
    roots.dedup();
    roots
}

/// Library locations under one root, most specific first.
fn ort_candidates(root: &Path) -> Vec<PathBuf> {
    let models = root.join("models");
    let mut candidates = Vec::new();

    if let Ok(entries) = std::fs::read_dir(&models) {
        let mut bundles: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("onnxruntime"))
            })
            .collect();
        bundles.sort();
        candidates.extend(bundles.into_iter().map(|b| b.join("lib").join(ORT_LIB)));
    }

    candidates.push(models.join(ORT_LIB));
    candidates
}

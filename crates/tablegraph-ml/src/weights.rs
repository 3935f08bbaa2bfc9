//! SafeTensors weight loading and checkpoint saving
//!
//! SafeTensors is a language-agnostic format (no Python pickle dependency),
//! used for the frozen extractor's pretrained weights, for checkpoints of the
//! trainable graph network and heads, and for dataset records.

use crate::error::{Result, TableGraphError};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashSet;
use std::path::Path;
use tch::{nn, Device, Tensor};

/// How to treat VarStore variables that the file cannot fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Any missing or mismatched variable is an error
    Strict,
    /// Load what matches and report the rest
    Lenient,
}

/// Outcome of copying a SafeTensors file into a VarStore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// VarStore variables absent from the file
    pub missing: Vec<String>,
    /// Variables present with a different shape or unsupported dtype
    pub mismatched: Vec<String>,
    /// File tensors with no matching variable
    pub unused: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Copy named tensors from `path` into the variables of `vs`
pub fn load_safetensors(vs: &mut nn::VarStore, path: &Path, mode: LoadMode) -> Result<LoadReport> {
    let load_error = |reason: String| TableGraphError::WeightLoadError {
        path: path.to_path_buf(),
        reason,
    };

    if !path.exists() {
        return Err(load_error("file not found".to_string()));
    }

    let buffer = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer).map_err(|e| load_error(e.to_string()))?;
    log::debug!(
        "Loaded {} tensors from SafeTensors file {}",
        tensors.names().len(),
        path.display()
    );

    let device = vs.device();
    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    let mut report = LoadReport::default();
    let mut used = HashSet::new();

    for (name, mut variable) in variables {
        let view = match tensors.tensor(&name) {
            Ok(view) => view,
            Err(_) => {
                report.missing.push(name);
                continue;
            }
        };
        used.insert(name.clone());

        let shape: Vec<i64> = view.shape().iter().map(|&s| s as i64).collect();
        if variable.size() != shape {
            log::debug!(
                "  Shape mismatch for '{}': VarStore {:?} vs SafeTensors {:?}",
                name,
                variable.size(),
                shape
            );
            report.mismatched.push(name);
            continue;
        }

        let loaded = match tensor_from_view(&view) {
            Ok(t) => t.to_device(device).to_kind(variable.kind()),
            Err(reason) => {
                log::debug!("  Skipping '{}': {}", name, reason);
                report.mismatched.push(name);
                continue;
            }
        };

        // Copy into VarStore (using no_grad to avoid autograd)
        tch::no_grad(|| {
            variable.copy_(&loaded);
        });
        report.loaded += 1;
    }

    let mut unused: Vec<String> = tensors
        .names()
        .into_iter()
        .filter(|n| !used.contains(*n))
        .map(|n| n.to_string())
        .collect();
    unused.sort();
    report.unused = unused;

    log::debug!(
        "Copied {} tensors ({} missing, {} mismatched, {} unused)",
        report.loaded,
        report.missing.len(),
        report.mismatched.len(),
        report.unused.len()
    );

    if mode == LoadMode::Strict && !report.is_complete() {
        let mut names: Vec<&str> = report
            .missing
            .iter()
            .chain(report.mismatched.iter())
            .map(String::as_str)
            .collect();
        let more = names.len().saturating_sub(5);
        names.truncate(5);
        return Err(load_error(format!(
            "{} missing and {} mismatched variables: {}{}",
            report.missing.len(),
            report.mismatched.len(),
            names.join(", "),
            if more > 0 { format!(" ... and {more} more") } else { String::new() }
        )));
    }

    Ok(report)
}

/// Write every variable of `vs` to a SafeTensors file
///
/// The format does not depend on the file extension, so anything written
/// here can be read back by [`load_safetensors`].
pub fn save_safetensors(vs: &nn::VarStore, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut named: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .map(|(name, var)| (name, var.detach().to_device(Device::Cpu).contiguous()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    Tensor::write_safetensors(&named, path)?;
    log::info!("Saved {} variables to {}", named.len(), path.display());
    Ok(())
}

/// Convert a SafeTensors view into a CPU tensor of the stored dtype
pub(crate) fn tensor_from_view(view: &TensorView<'_>) -> std::result::Result<Tensor, String> {
    let shape: Vec<i64> = view.shape().iter().map(|&s| s as i64).collect();
    let data = view.data();
    let tensor = match view.dtype() {
        Dtype::F32 => Tensor::from_slice(&pod_vec::<f32>(data)),
        Dtype::F64 => Tensor::from_slice(&pod_vec::<f64>(data)),
        Dtype::F16 => {
            let values: Vec<f32> = pod_vec::<half::f16>(data)
                .into_iter()
                .map(half::f16::to_f32)
                .collect();
            Tensor::from_slice(&values)
        }
        Dtype::I64 => Tensor::from_slice(&pod_vec::<i64>(data)),
        Dtype::I32 => Tensor::from_slice(&pod_vec::<i32>(data)),
        Dtype::U8 | Dtype::BOOL => Tensor::from_slice(data),
        other => return Err(format!("unsupported dtype {other:?}")),
    };
    Ok(tensor.reshape(&shape))
}

/// Reinterpret little-endian bytes, copying when the buffer is unaligned
fn pod_vec<T: bytemuck::Pod>(data: &[u8]) -> Vec<T> {
    match bytemuck::try_cast_slice::<u8, T>(data) {
        Ok(values) => values.to_vec(),
        Err(_) => data
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect(),
    }
}

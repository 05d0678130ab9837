//! Reading and writing parameter tensors.
//!
//! Checkpoints are safetensors files produced by `VarStore::save`. Pretrained
//! weights are any safetensors file using torchvision AlexNet names; they are
//! copied tensor by tensor wherever name and shape agree.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use bytemuck::allocation::pod_collect_to_vec;
use half::f16;
use log::{debug, info, warn};
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};

use crate::error::{PipelineError, PipelineResult};

pub fn load_safetensors_to_map(path: &Path) -> PipelineResult<HashMap<String, Tensor>> {
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    let st = SafeTensors::deserialize(&bytes)?;
    let mut map: HashMap<String, Tensor> = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name)?;
        let shape_i64: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        // the data section is not guaranteed to be aligned, so copy out
        let t = match tv.dtype() {
            Dtype::F32 => {
                let values: Vec<f32> = pod_collect_to_vec(data);
                Tensor::from_slice(&values).reshape(&shape_i64)
            }
            Dtype::F16 => {
                let bits: Vec<u16> = pod_collect_to_vec(data);
                let values: Vec<f32> = bits.iter().map(|&h| f16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&values).reshape(&shape_i64)
            }
            Dtype::I64 => {
                let values: Vec<i64> = pod_collect_to_vec(data);
                Tensor::from_slice(&values).reshape(&shape_i64).to_kind(Kind::Int64)
            }
            Dtype::I32 => {
                let values: Vec<i32> = pod_collect_to_vec(data);
                Tensor::from_slice(&values).reshape(&shape_i64).to_kind(Kind::Int)
            }
            other => {
                warn!("skipping tensor {} with unsupported dtype {:?}", name, other);
                continue;
            }
        };

        map.insert(name.to_string(), t);
    }
    Ok(map)
}

// copy util: copy only when the destination exists with the same shape
fn try_copy(dst: &mut HashMap<String, Tensor>, name: &str, src: &Tensor) -> PipelineResult<bool> {
    if let Some(d) = dst.get_mut(name) {
        if d.size() == src.size() {
            tch::no_grad(|| d.f_copy_(src))?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Copies every pretrained tensor whose name and shape exist in `target`.
/// A head sized for a different class count is left at its initial values.
pub fn load_pretrained(target: &mut nn::VarStore, path: &Path) -> PipelineResult<usize> {
    let src = load_safetensors_to_map(path)?;
    let mut tgt_vars = target.variables();

    let mut copied = 0usize;
    for (name, t) in src.iter() {
        if try_copy(&mut tgt_vars, name, t)? {
            copied += 1;
        } else {
            debug!("pretrained tensor {} {:?} not used", name, t.size());
        }
    }

    if copied == 0 {
        return Err(PipelineError::NothingCopied(path.to_path_buf()));
    }
    info!("loaded pretrained weights from {:?} ({} of {} tensors)", path, copied, tgt_vars.len());
    Ok(copied)
}

/// Fills every variable of `target` from the checkpoint at `path`. All
/// variables must be present with identical shapes.
pub fn load_checkpoint(target: &mut nn::VarStore, path: &Path) -> PipelineResult<()> {
    let src = load_safetensors_to_map(path)?;
    let mut tgt_vars = target.variables();

    let mut names: Vec<String> = tgt_vars.keys().cloned().collect();
    names.sort();
    for name in names {
        let Some(t) = src.get(&name) else {
            return Err(PipelineError::MissingTensor {
                path: path.to_path_buf(),
                name,
            });
        };
        let expected = tgt_vars[&name].size();
        if !try_copy(&mut tgt_vars, &name, t)? {
            return Err(PipelineError::ShapeMismatch {
                path: path.to_path_buf(),
                name,
                expected,
                found: t.size(),
            });
        }
    }
    debug!("restored {} tensors from {:?}", tgt_vars.len(), path);
    Ok(())
}

pub fn save_checkpoint(vs: &nn::VarStore, path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    vs.save(path)?;
    info!("saved checkpoint {:?}", path);
    Ok(())
}

/// Copies the variables of `src` selected by `keep` into `dst`. Selected
/// variables must exist in both stores with the same shape.
pub fn copy_matching(src: &nn::VarStore, dst: &mut nn::VarStore, keep: impl Fn(&str) -> bool) -> PipelineResult<usize> {
    let src_vars = src.variables();
    let mut dst_vars = dst.variables();
    let mut copied = 0usize;
    for (name, t) in src_vars.iter().filter(|(name, _)| keep(name)) {
        if !try_copy(&mut dst_vars, name, t)? {
            let expected = dst_vars.get(name).map(|d| d.size()).unwrap_or_default();
            return Err(PipelineError::ShapeMismatch {
                path: Default::default(),
                name: name.clone(),
                expected,
                found: t.size(),
            });
        }
        copied += 1;
    }
    Ok(copied)
}

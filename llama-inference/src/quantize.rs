//! Streaming requantization: reads a model through the loader with mapping
//! disabled, rewrites eligible weight tensors in a lower-precision dtype,
//! and saves the result in the latest (ggjt) format.

use crate::error::{Error, Result};
use crate::loader::{FileSaver, ModelLoader};
use crate::model::Ftype;
use crate::tensor::{self, Dtype};
use log::info;
use std::path::Path;

/// Requantize the model at `fname_inp` into `fname_out` with the target
/// file type (`MostlyQ4_0` or `MostlyQ4_1`).
pub fn quantize_model(fname_inp: &Path, fname_out: &Path, ftype: Ftype) -> Result<()> {
    let quantized_type = match ftype {
        Ftype::MostlyQ4_0 => Dtype::Q4_0,
        Ftype::MostlyQ4_1 => Dtype::Q4_1,
        other => return Err(Error::InvalidQuantizationTarget(other.to_u32())),
    };

    let mut loader = ModelLoader::open(fname_inp, None, false, false)?;
    let hparams = loader.hparams().clone();
    let vocab_tokens = loader.take_vocab();
    let mut saver = FileSaver::create(
        fname_out,
        &hparams,
        ftype,
        &vocab_tokens,
        loader.file_version(),
    )?;

    let mut total_size_org = 0usize;
    let mut total_size_new = 0usize;
    let mut hist_all = [0i64; 16];

    let n_tensors = loader.tensors().len();
    for idx in 0..n_tensors {
        let (name, dtype, ne, size) = {
            let tensor = &loader.tensors()[idx];
            (
                tensor.name.clone(),
                tensor.dtype,
                tensor.ne.clone(),
                tensor.size,
            )
        };
        let data = loader.load_tensor_data(idx)?;

        // Only 2-D "...weight" tensors are quantized; norms and any 1-D data
        // keep their original bytes.
        let quantize = name.ends_with("weight") && ne.len() == 2;

        if !quantize {
            info!(
                "[{:3}/{:3}] {:40} {:?}, type = {:5}, size = {:8.3} MB",
                idx + 1,
                n_tensors,
                name,
                ne,
                dtype.name(),
                size as f64 / 1024.0 / 1024.0
            );
            total_size_new += data.len();
            saver.write_tensor(&name, dtype, &ne, &data)?;
        } else {
            if dtype.is_quantized() {
                return Err(Error::InvalidQuantizationTarget(dtype.to_u32()));
            }
            let nelements = ne[0] * ne[1];
            let mut f32_data = vec![0.0f32; nelements];
            tensor::dequantize(dtype, &data, &mut f32_data);

            let mut new_data = Vec::with_capacity(size);
            let mut hist_cur = [0i64; 16];
            let new_size = match quantized_type {
                Dtype::Q4_0 => {
                    tensor::quantize_q4_0(&f32_data, &mut new_data, ne[0], &mut hist_cur)
                }
                Dtype::Q4_1 => {
                    tensor::quantize_q4_1(&f32_data, &mut new_data, ne[0], &mut hist_cur)
                }
                _ => unreachable!("target dtype is always 4-bit"),
            };

            info!(
                "[{:3}/{:3}] {:40} {:?}, {:5} -> {:5}, {:8.2} MB -> {:8.2} MB | hist: {}",
                idx + 1,
                n_tensors,
                name,
                ne,
                dtype.name(),
                quantized_type.name(),
                size as f64 / 1024.0 / 1024.0,
                new_size as f64 / 1024.0 / 1024.0,
                format_hist(&hist_cur, nelements as i64)
            );
            for (all, cur) in hist_all.iter_mut().zip(&hist_cur) {
                *all += cur;
            }
            total_size_new += new_size;
            saver.write_tensor(&name, quantized_type, &ne, &new_data)?;
        }
        total_size_org += size;
    }
    saver.finish()?;

    info!("model size = {:8.2} MB", total_size_org as f64 / 1024.0 / 1024.0);
    info!("quant size = {:8.2} MB", total_size_new as f64 / 1024.0 / 1024.0);

    let sum_all: i64 = hist_all.iter().sum();
    if sum_all > 0 {
        info!("hist: {}", format_hist(&hist_all, sum_all));
    }
    Ok(())
}

fn format_hist(hist: &[i64; 16], total: i64) -> String {
    hist.iter()
        .map(|&count| format!("{:5.3} ", count as f64 / total as f64))
        .collect()
}

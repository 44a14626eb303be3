use crate::io::model::{load_json, NormalizationConfig};
use crate::types::{PipelineError, PipelineResult};
use ndarray::{s, stack, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    #[default]
    None,
}

/// 2-D convolution with odd square kernel and "same" zero padding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvLayer {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    /// Flattened as [out][in][ky][kx]
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCheckpoint {
    pub layers: Vec<ConvLayer>,
}

impl ConvLayer {
    fn kernel(&self) -> PipelineResult<ArrayView4<'_, f32>> {
        let k = self.kernel_size;
        Ok(ArrayView4::from_shape(
            (self.out_channels, self.in_channels, k, k),
            &self.weights,
        )?)
    }

    fn output_channel(&self, kernel: &ArrayView4<f32>, input: &ArrayView3<f32>, o: usize) -> Array2<f32> {
        let (_, rows, cols) = input.dim();
        let (rows_i, cols_i) = (rows as isize, cols as isize);
        let half = (self.kernel_size / 2) as isize;
        let mut out = Array2::from_elem((rows, cols), self.bias[o]);

        for i in 0..self.in_channels {
            let channel = input.index_axis(Axis(0), i);
            for ky in 0..self.kernel_size {
                let dy = ky as isize - half;
                let (r0, r1) = ((-dy).max(0), rows_i.min(rows_i - dy));
                if r0 >= r1 {
                    continue;
                }
                for kx in 0..self.kernel_size {
                    let dx = kx as isize - half;
                    let (c0, c1) = ((-dx).max(0), cols_i.min(cols_i - dx));
                    if c0 >= c1 {
                        continue;
                    }
                    let w = kernel[[o, i, ky, kx]];
                    if w == 0.0 {
                        continue;
                    }
                    out.slice_mut(s![r0..r1, c0..c1])
                        .scaled_add(w, &channel.slice(s![r0 + dy..r1 + dy, c0 + dx..c1 + dx]));
                }
            }
        }

        if self.activation == Activation::Relu {
            out.mapv_inplace(|v| v.max(0.0));
        }
        out
    }

    pub fn forward(&self, input: ArrayView3<f32>) -> PipelineResult<Array3<f32>> {
        if input.len_of(Axis(0)) != self.in_channels {
            return Err(PipelineError::Model(format!(
                "layer expects {} channels, got {}",
                self.in_channels,
                input.len_of(Axis(0))
            )));
        }
        let kernel = self.kernel()?;

        #[cfg(feature = "parallel")]
        let channels: Vec<Array2<f32>> = {
            use rayon::prelude::*;
            (0..self.out_channels)
                .into_par_iter()
                .map(|o| self.output_channel(&kernel, &input, o))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let channels: Vec<Array2<f32>> = (0..self.out_channels)
            .map(|o| self.output_channel(&kernel, &input, o))
            .collect();

        let views: Vec<ArrayView2<f32>> = channels.iter().map(|c| c.view()).collect();
        Ok(stack(Axis(0), &views)?)
    }
}

/// Fully convolutional segmentation network over normalised feature tiles
#[derive(Debug, Clone)]
pub struct ConvSegmenter {
    layers: Vec<ConvLayer>,
    norm: NormalizationConfig,
}

impl ConvSegmenter {
    pub fn new(layers: Vec<ConvLayer>, norm: NormalizationConfig) -> PipelineResult<Self> {
        norm.validate()?;
        let n_features = norm.mean.len();
        if layers.is_empty() {
            return Err(PipelineError::Model("checkpoint has no layers".to_string()));
        }

        let last = layers.len() - 1;
        let mut channels = n_features;
        for (i, layer) in layers.iter().enumerate() {
            if layer.in_channels != channels {
                return Err(PipelineError::Model(format!(
                    "layer {} takes {} channels, previous output has {}",
                    i, layer.in_channels, channels
                )));
            }
            let expected_out = if i == last { norm.n_classes } else { norm.n_hchannels };
            if layer.out_channels != expected_out {
                return Err(PipelineError::Model(format!(
                    "layer {} outputs {} channels, expected {}",
                    i, layer.out_channels, expected_out
                )));
            }
            if layer.kernel_size % 2 == 0 {
                return Err(PipelineError::Model(format!(
                    "layer {} kernel size {} must be odd",
                    i, layer.kernel_size
                )));
            }
            let weights = layer.out_channels * layer.in_channels * layer.kernel_size * layer.kernel_size;
            if layer.weights.len() != weights || layer.bias.len() != layer.out_channels {
                return Err(PipelineError::Model(format!(
                    "layer {} has {} weights and {} biases, expected {} and {}",
                    i,
                    layer.weights.len(),
                    layer.bias.len(),
                    weights,
                    layer.out_channels
                )));
            }
            channels = layer.out_channels;
        }

        Ok(Self { layers, norm })
    }

    pub fn load<P: AsRef<Path>>(path: P, norm: NormalizationConfig) -> PipelineResult<Self> {
        let checkpoint: ConvCheckpoint = load_json(path)?;
        let model = Self::new(checkpoint.layers, norm)?;
        log::info!(
            "🧠 Segmentation network loaded: {} layers, {} features, {} classes, tile {}",
            model.layers.len(),
            model.norm.mean.len(),
            model.norm.n_classes,
            model.norm.tile_size
        );
        Ok(model)
    }

    pub fn n_features(&self) -> usize {
        self.norm.mean.len()
    }

    pub fn tile_size(&self) -> usize {
        self.norm.tile_size
    }

    /// Replace NaN by the feature mean, then standardise
    pub fn preprocess(&self, features: ArrayView3<f32>) -> Array3<f32> {
        let mut tensor = features.to_owned();
        for (i, mut channel) in tensor.axis_iter_mut(Axis(0)).enumerate() {
            let (mean, std) = (self.norm.mean[i], self.norm.std[i]);
            channel.mapv_inplace(|v| {
                let v = if v.is_nan() { mean } else { v };
                (v - mean) / std
            });
        }
        tensor
    }

    /// Per-pixel 1-based labels and maximum softmax probability
    pub fn segment(&self, features: ArrayView3<f32>) -> PipelineResult<(Array2<u8>, Array2<f32>)> {
        let (n, rows, cols) = features.dim();
        if n != self.n_features() {
            return Err(PipelineError::Model(format!(
                "network expects {} features, got {}",
                self.n_features(),
                n
            )));
        }
        let tile = self.tile_size();
        if rows != tile || cols != tile {
            return Err(PipelineError::ShapeMismatch {
                context: "segmentation tile".to_string(),
                expected: (tile, tile),
                found: (rows, cols),
            });
        }

        let mut x = self.preprocess(features);
        for layer in &self.layers {
            x = layer.forward(x.view())?;
        }

        let max = x.fold_axis(Axis(0), f32::NEG_INFINITY, |a, &v| a.max(v));
        let mut exps = x;
        for mut channel in exps.axis_iter_mut(Axis(0)) {
            channel -= &max;
            channel.mapv_inplace(f32::exp);
        }
        let sum = exps.sum_axis(Axis(0));
        for mut channel in exps.axis_iter_mut(Axis(0)) {
            channel /= &sum;
        }

        let labels = exps.map_axis(Axis(0), |p| {
            p.iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
                .0 as u8
                + 1
        });
        let probability = exps.fold_axis(Axis(0), 0.0f32, |a, &v| a.max(v));
        Ok((labels, probability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn norm(tile_size: usize) -> NormalizationConfig {
        NormalizationConfig {
            features: vec!["B01".into()],
            n_classes: 2,
            n_hchannels: 1,
            mean: vec![0.5],
            std: vec![0.5],
            tile_size,
        }
    }

    fn identity(in_channels: usize, out_channels: usize, activation: Activation) -> ConvLayer {
        ConvLayer {
            in_channels,
            out_channels,
            kernel_size: 1,
            weights: vec![1.0; in_channels * out_channels],
            bias: vec![0.0; out_channels],
            activation,
        }
    }

    #[test]
    fn test_same_padding_box_filter() {
        let layer = ConvLayer {
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            weights: vec![1.0; 9],
            bias: vec![0.5],
            activation: Activation::None,
        };
        let input = Array3::from_elem((1, 3, 3), 1.0f32);
        let out = layer.forward(input.view()).unwrap();
        assert_eq!(
            out.index_axis(Axis(0), 0),
            array![[4.5f32, 6.5, 4.5], [6.5, 9.5, 6.5], [4.5, 6.5, 4.5]]
        );
    }

    #[test]
    fn test_kernel_orientation() {
        // Only the right-hand tap is set: out[r, c] = in[r, c + 1]
        let mut weights = vec![0.0; 9];
        weights[5] = 1.0;
        let layer = ConvLayer {
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            weights,
            bias: vec![0.0],
            activation: Activation::None,
        };
        let input = array![[1.0f32, 2.0, 3.0]].insert_axis(Axis(0));
        let out = layer.forward(input.view()).unwrap();
        assert_eq!(out.index_axis(Axis(0), 0), array![[2.0f32, 3.0, 0.0]]);
    }

    #[test]
    fn test_segment_labels_and_probabilities() {
        // Hidden relu copies the standardised input; output: class 1 logit 0, class 2 logit = 2 * hidden
        let layers = vec![
            identity(1, 1, Activation::Relu),
            ConvLayer {
                in_channels: 1,
                out_channels: 2,
                kernel_size: 1,
                weights: vec![0.0, 2.0],
                bias: vec![0.0, 0.0],
                activation: Activation::None,
            },
        ];
        let model = ConvSegmenter::new(layers, norm(2)).unwrap();
        let input = array![[0.0f32, 1.0], [f32::NAN, 1.5]].insert_axis(Axis(0));
        let (labels, proba) = model.segment(input.view()).unwrap();

        // standardised: [-1, 1], [0 (NaN -> mean), 2]; relu: [0, 1], [0, 2]
        assert_eq!(labels, array![[1u8, 2], [1, 2]]);
        assert_relative_eq!(proba[[0, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(proba[[1, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(proba[[0, 1]], 1.0 / (1.0 + (-2.0f32).exp()), epsilon = 1e-6);
        assert_relative_eq!(proba[[1, 1]], 1.0 / (1.0 + (-4.0f32).exp()), epsilon = 1e-6);
    }

    #[test]
    fn test_wrong_tile_size_rejected() {
        let layers = vec![identity(1, 1, Activation::Relu), identity(1, 2, Activation::None)];
        let model = ConvSegmenter::new(layers, norm(4)).unwrap();
        let input = Array3::<f32>::zeros((1, 2, 2));
        assert!(matches!(
            model.segment(input.view()),
            Err(PipelineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_layer_chaining_validated() {
        let layers = vec![identity(1, 3, Activation::Relu), identity(1, 2, Activation::None)];
        assert!(matches!(ConvSegmenter::new(layers, norm(2)), Err(PipelineError::Model(_))));

        let even = ConvLayer {
            kernel_size: 2,
            weights: vec![0.0; 8],
            ..identity(1, 2, Activation::None)
        };
        let layers = vec![identity(1, 1, Activation::Relu), even];
        assert!(ConvSegmenter::new(layers, norm(2)).is_err());
    }
}

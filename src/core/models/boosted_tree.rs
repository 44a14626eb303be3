use crate::core::classifier::{LabelBase, PixelClassifier};
use crate::core::cloud_mask::{CloudProbabilityModel, CLOUD_BANDS};
use crate::io::model::load_json;
use crate::types::{PipelineError, PipelineResult};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node of a boosted tree; splits go left when `x < threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoostedNode {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        leaf: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTree {
    /// Class whose margin this tree contributes to
    #[serde(default)]
    pub class: usize,
    pub nodes: Vec<BoostedNode>,
}

impl BoostedTree {
    fn margin(&self, row: ArrayView1<f32>) -> f32 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                BoostedNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold { *left } else { *right };
                }
                BoostedNode::Leaf { leaf } => return *leaf,
            }
        }
    }
}

/// Gradient boosted trees with softmax (or logistic, for one margin) output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTreeModel {
    /// Number of margins; 1 means a binary logistic model with two output classes
    pub n_classes: usize,
    pub n_features: usize,
    #[serde(default)]
    pub base_score: f32,
    pub trees: Vec<BoostedTree>,
}

impl BoostedTreeModel {
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let model: Self = load_json(path)?;
        model.validate()?;
        log::info!(
            "🌳 Boosted trees loaded: {} trees, {} features, {} classes",
            model.trees.len(),
            model.n_features,
            model.output_classes()
        );
        Ok(model)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.n_classes == 0 || self.trees.is_empty() {
            return Err(PipelineError::Model("boosted model has no classes or no trees".to_string()));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.class >= self.n_classes {
                return Err(PipelineError::Model(format!(
                    "tree {} targets class {} of {}",
                    t, tree.class, self.n_classes
                )));
            }
            if tree.nodes.is_empty() {
                return Err(PipelineError::Model(format!("tree {} is empty", t)));
            }
            let n = tree.nodes.len();
            for (i, node) in tree.nodes.iter().enumerate() {
                if let BoostedNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    if *feature >= self.n_features
                        || *left <= i
                        || *right <= i
                        || *left >= n
                        || *right >= n
                    {
                        return Err(PipelineError::Model(format!(
                            "tree {} node {} is malformed",
                            t, i
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of probability columns
    pub fn output_classes(&self) -> usize {
        if self.n_classes == 1 {
            2
        } else {
            self.n_classes
        }
    }

    fn row_proba(&self, row: ArrayView1<f32>) -> Vec<f32> {
        let mut margins = vec![self.base_score; self.n_classes];
        for tree in &self.trees {
            margins[tree.class] += tree.margin(row);
        }
        if self.n_classes == 1 {
            let p = 1.0 / (1.0 + (-margins[0]).exp());
            return vec![1.0 - p, p];
        }
        let max = margins.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = margins.iter().map(|m| (m - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }
}

impl PixelClassifier for BoostedTreeModel {
    fn label_base(&self) -> LabelBase {
        LabelBase::ZeroBased
    }

    fn predict(&self, table: ArrayView2<f32>) -> PipelineResult<Array1<u8>> {
        let proba = self.predict_proba(table)?;
        Ok(proba.map_axis(Axis(1), |row| {
            row.iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc })
                .0 as u8
        }))
    }

    fn predict_proba(&self, table: ArrayView2<f32>) -> PipelineResult<Array2<f32>> {
        if table.ncols() != self.n_features {
            return Err(PipelineError::Model(format!(
                "boosted model expects {} features, table has {}",
                self.n_features,
                table.ncols()
            )));
        }
        let rows = table.nrows();
        let classes = self.output_classes();

        #[cfg(feature = "parallel")]
        let flat: Vec<f32> = {
            use rayon::prelude::*;
            (0..rows)
                .into_par_iter()
                .flat_map_iter(|r| self.row_proba(table.row(r)))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let flat: Vec<f32> = (0..rows).flat_map(|r| self.row_proba(table.row(r))).collect();

        Ok(Array2::from_shape_vec((rows, classes), flat)?)
    }
}

impl CloudProbabilityModel for BoostedTreeModel {
    /// Probability of the positive class; pixels with any NaN band get 0
    fn probability(&self, bands: &Array3<f32>) -> PipelineResult<Array2<f32>> {
        let (n_bands, rows, cols) = bands.dim();
        if n_bands != CLOUD_BANDS.len() || self.n_features != n_bands || self.output_classes() != 2 {
            return Err(PipelineError::Model(format!(
                "cloud model must be binary over {} bands (model: {} features, {} classes)",
                CLOUD_BANDS.len(),
                self.n_features,
                self.output_classes()
            )));
        }

        let table = Array2::from_shape_fn((rows * cols, n_bands), |(p, b)| bands[[b, p / cols, p % cols]]);
        let valid: Vec<usize> = table
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().all(|v| !v.is_nan()))
            .map(|(i, _)| i)
            .collect();

        let mut probability = Array1::<f32>::zeros(rows * cols);
        if !valid.is_empty() {
            let proba = self.predict_proba(table.select(Axis(0), &valid).view())?;
            for (k, &i) in valid.iter().enumerate() {
                probability[i] = proba[[k, 1]];
            }
        }
        Ok(probability.into_shape((rows, cols))?)
    }
}

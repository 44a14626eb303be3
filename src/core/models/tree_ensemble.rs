use crate::core::classifier::{LabelBase, PixelClassifier};
use crate::io::model::load_json;
use crate::types::{PipelineError, PipelineResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node of a decision tree; splits go left when `x <= threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        /// Class probabilities in `classes` order
        value: Vec<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn leaf(&self, row: ArrayView1<f32>) -> &[f32] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { value } => return value,
            }
        }
    }
}

/// Random forest: class probabilities averaged over the trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsembleModel {
    /// Output label of each probability column (1-based)
    pub classes: Vec<u8>,
    pub n_features: usize,
    pub trees: Vec<DecisionTree>,
}

impl TreeEnsembleModel {
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let model: Self = load_json(path)?;
        model.validate()?;
        log::info!(
            "🌲 Random forest loaded: {} trees, {} features, {} classes",
            model.trees.len(),
            model.n_features,
            model.classes.len()
        );
        Ok(model)
    }

    /// Child indices must point forward so every walk reaches a leaf
    pub fn validate(&self) -> PipelineResult<()> {
        if self.classes.is_empty() || self.trees.is_empty() {
            return Err(PipelineError::Model("forest has no classes or no trees".to_string()));
        }
        if self.classes.contains(&0) {
            return Err(PipelineError::Model(
                "class label 0 is reserved for unclassified pixels".to_string(),
            ));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(PipelineError::Model(format!("tree {} is empty", t)));
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                match node {
                    TreeNode::Split {
                        feature,
                        left,
                        right,
                        ..
                    } => {
                        if *feature >= self.n_features {
                            return Err(PipelineError::Model(format!(
                                "tree {} node {} splits on feature {} of {}",
                                t, i, feature, self.n_features
                            )));
                        }
                        let n = tree.nodes.len();
                        if *left <= i || *right <= i || *left >= n || *right >= n {
                            return Err(PipelineError::Model(format!(
                                "tree {} node {} has invalid children",
                                t, i
                            )));
                        }
                    }
                    TreeNode::Leaf { value } => {
                        if value.len() != self.classes.len() {
                            return Err(PipelineError::Model(format!(
                                "tree {} leaf {} has {} probabilities for {} classes",
                                t,
                                i,
                                value.len(),
                                self.classes.len()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn row_proba(&self, row: ArrayView1<f32>) -> Vec<f32> {
        let mut sum = vec![0.0f32; self.classes.len()];
        for tree in &self.trees {
            for (s, v) in sum.iter_mut().zip(tree.leaf(row)) {
                *s += v;
            }
        }
        let n = self.trees.len() as f32;
        sum.iter_mut().for_each(|s| *s /= n);
        sum
    }

    fn check_width(&self, table: &ArrayView2<f32>) -> PipelineResult<()> {
        if table.ncols() != self.n_features {
            return Err(PipelineError::Model(format!(
                "forest expects {} features, table has {}",
                self.n_features,
                table.ncols()
            )));
        }
        Ok(())
    }
}

impl PixelClassifier for TreeEnsembleModel {
    fn label_base(&self) -> LabelBase {
        LabelBase::OneBased
    }

    fn predict(&self, table: ArrayView2<f32>) -> PipelineResult<Array1<u8>> {
        let proba = self.predict_proba(table)?;
        Ok(proba.map_axis(Axis(1), |row| {
            let best = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });
            self.classes[best.0]
        }))
    }

    fn predict_proba(&self, table: ArrayView2<f32>) -> PipelineResult<Array2<f32>> {
        self.check_width(&table)?;
        let rows = table.nrows();

        #[cfg(feature = "parallel")]
        let probabilities: Vec<Vec<f32>> = {
            use rayon::prelude::*;
            (0..rows)
                .into_par_iter()
                .map(|r| self.row_proba(table.row(r)))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let probabilities: Vec<Vec<f32>> = (0..rows).map(|r| self.row_proba(table.row(r))).collect();

        let flat: Vec<f32> = probabilities.into_iter().flatten().collect();
        Ok(Array2::from_shape_vec((rows, self.classes.len()), flat)?)
    }
}

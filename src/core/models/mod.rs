//! Classifier backends

pub mod boosted_tree;
pub mod conv_segmenter;
pub mod tree_ensemble;

pub use boosted_tree::{BoostedNode, BoostedTree, BoostedTreeModel};
pub use conv_segmenter::{Activation, ConvCheckpoint, ConvLayer, ConvSegmenter};
pub use tree_ensemble::{DecisionTree, TreeEnsembleModel, TreeNode};

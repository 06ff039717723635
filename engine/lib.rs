
pub mod data;
pub mod faer_ndarray;
pub mod grid;
pub mod model;
pub mod predict;
pub mod quadrature;
pub mod result;
pub mod simulate;
pub mod terms;
pub mod variance;

pub use data::{DataError, load_frame};
pub use grid::{CategoricalWeighting, Condition, PredictionGrid, Setting, Typical};
pub use model::{
    Capability, Family, FittedModel, GroupLevel, GroupingFactor, LinearPredictor, LinkFunction,
    ModelError, ModelFrame, ModelTerm, RandomEffects, Value, Variable,
};
pub use predict::{PredictOptions, PredictionError, PredictionType, predict_marginal};
pub use result::{PredictionResult, PredictionRow};
pub use terms::{FocalTerm, Selector, TermError, TermSpec};
pub use variance::mean_random_effect_variance;

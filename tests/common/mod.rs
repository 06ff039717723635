//! Shared fixtures for the integration tests: small fitted models built from
//! closed-form least squares or fixed estimates.

#![allow(dead_code)]

use marginal::faer_ndarray::FaerCholesky;
use marginal::{
    Family, FittedModel, GroupingFactor, LinearPredictor, LinkFunction, ModelFrame, ModelTerm,
    RandomEffects, Variable,
};
use faer::Side;
use ndarray::{Array1, Array2, array};

/// Ordinary least squares: coefficients, their covariance, residual SD and
/// residual degrees of freedom.
pub struct OlsFit {
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
    pub sigma: f64,
    pub df: f64,
}

pub fn ols(x: &Array2<f64>, y: &Array1<f64>) -> OlsFit {
    let xtx = x.t().dot(x);
    let xty = x.t().dot(y);
    let chol = xtx.cholesky(Side::Lower).expect("X'X must be positive definite");
    let coefficients = chol.solve_vec(&xty);
    let residuals = y - &x.dot(&coefficients);
    let df = (x.nrows() - x.ncols()) as f64;
    let sigma2 = residuals.dot(&residuals) / df;
    let xtx_inv = chol.solve_mat(&Array2::eye(x.ncols()));
    OlsFit {
        coefficients,
        covariance: xtx_inv * sigma2,
        sigma: sigma2.sqrt(),
        df,
    }
}

/// Levels, temperatures and yields of a small `yield ~ batch + temp` experiment.
pub fn batch_data() -> (Vec<&'static str>, Vec<f64>, Vec<f64>) {
    let batch = vec!["A", "A", "A", "A", "B", "B", "B", "B", "C", "C", "C", "C"];
    let temp = vec![
        18.0, 21.0, 24.0, 27.0, 19.0, 22.0, 25.0, 28.0, 17.0, 20.0, 23.0, 26.0,
    ];
    let noise = [0.3, -0.2, 0.1, -0.4, 0.2, 0.0, -0.1, 0.3, -0.3, 0.4, -0.2, 0.1];
    let yields = batch
        .iter()
        .zip(&temp)
        .zip(noise)
        .map(|((b, t), e)| {
            let shift = match *b {
                "B" => 2.0,
                "C" => -1.5,
                _ => 0.0,
            };
            10.0 + shift + 0.3 * t + e
        })
        .collect();
    (batch, temp, yields)
}

/// Design row of `yield ~ batch + temp` under treatment coding.
pub fn batch_design_row(batch: &str, temp: f64) -> [f64; 4] {
    [
        1.0,
        if batch == "B" { 1.0 } else { 0.0 },
        if batch == "C" { 1.0 } else { 0.0 },
        temp,
    ]
}

/// Linear model `yield ~ batch + temp` fitted to [`batch_data`].
pub fn batch_model() -> FittedModel {
    let (batch, temp, yields) = batch_data();
    let rows: Vec<f64> = batch
        .iter()
        .zip(&temp)
        .flat_map(|(b, t)| batch_design_row(b, *t))
        .collect();
    let x = Array2::from_shape_vec((batch.len(), 4), rows).unwrap();
    let fit = ols(&x, &Array1::from(yields));

    FittedModel {
        family: Family::Gaussian,
        conditional: LinearPredictor {
            link: LinkFunction::Identity,
            terms: vec![
                ModelTerm::Intercept,
                ModelTerm::factor("batch"),
                ModelTerm::numeric("temp"),
            ],
            coefficients: fit.coefficients,
            covariance: fit.covariance,
        },
        zero_inflation: None,
        random_effects: None,
        residual_df: Some(fit.df),
        dispersion: Some(fit.sigma),
        frame: ModelFrame::new()
            .with(
                "batch",
                Variable::Categorical {
                    levels: vec!["A".into(), "B".into(), "C".into()],
                    counts: vec![4, 4, 4],
                },
            )
            .with("temp", Variable::numeric(temp)),
    }
}

/// Logistic mixed model with a random intercept for `site`.
pub fn mixed_logit_model() -> FittedModel {
    FittedModel {
        family: Family::Binomial,
        conditional: LinearPredictor {
            link: LinkFunction::Logit,
            terms: vec![
                ModelTerm::Intercept,
                ModelTerm::numeric("x"),
                ModelTerm::factor("group"),
            ],
            coefficients: array![-0.5, 0.8, 0.4, -0.6, 0.2],
            covariance: array![
                [0.04, -0.005, -0.01, -0.01, -0.01],
                [-0.005, 0.01, 0.0, 0.0, 0.0],
                [-0.01, 0.0, 0.03, 0.005, 0.005],
                [-0.01, 0.0, 0.005, 0.03, 0.005],
                [-0.01, 0.0, 0.005, 0.005, 0.03]
            ],
        },
        zero_inflation: None,
        random_effects: Some(RandomEffects {
            conditional: vec![GroupingFactor::intercept(
                "site",
                0.8,
                [
                    ("s1".to_string(), 0.5),
                    ("s2".to_string(), -0.2),
                    ("s3".to_string(), 0.9),
                    ("s4".to_string(), -1.1),
                    ("s5".to_string(), 0.1),
                ],
            )],
            zero_inflation: Vec::new(),
        }),
        residual_df: None,
        dispersion: None,
        frame: ModelFrame::new()
            .with(
                "x",
                Variable::numeric(vec![-2.0, -1.2, -0.5, 0.0, 0.4, 1.1, 1.6, 2.3]),
            )
            .with("group", Variable::categorical(["A", "B", "C", "D"])),
    }
}

/// Zero-inflated Poisson mixed model with a large random-intercept variance.
pub fn zero_inflated_model() -> FittedModel {
    FittedModel {
        family: Family::Poisson,
        conditional: LinearPredictor {
            link: LinkFunction::Log,
            terms: vec![ModelTerm::Intercept, ModelTerm::factor("treatment")],
            coefficients: array![1.2, -0.7],
            covariance: array![[0.02, -0.02], [-0.02, 0.05]],
        },
        zero_inflation: Some(LinearPredictor {
            link: LinkFunction::Logit,
            terms: vec![ModelTerm::Intercept, ModelTerm::factor("treatment")],
            coefficients: array![-1.0, 0.5],
            covariance: array![[0.09, -0.09], [-0.09, 0.2]],
        }),
        random_effects: Some(RandomEffects {
            conditional: vec![GroupingFactor::intercept(
                "pond",
                2.0,
                [("p1".to_string(), 1.0), ("p2".to_string(), -1.0)],
            )],
            zero_inflation: Vec::new(),
        }),
        residual_df: None,
        dispersion: None,
        frame: ModelFrame::new().with(
            "treatment",
            Variable::categorical(["control", "exposed"]),
        ),
    }
}

mod common;

use approx::assert_abs_diff_eq;
use common::{batch_design_row, batch_model, mixed_logit_model, ols, zero_inflated_model};
use marginal::{
    Condition, Family, FittedModel, LinearPredictor, LinkFunction, ModelFrame, ModelTerm,
    PredictOptions, PredictionError, PredictionResult, PredictionType, TermError, TermSpec, Value,
    Variable, predict_marginal,
};
use ndarray::{Array1, Array2};

fn predict(
    model: &FittedModel,
    terms: &[&str],
    prediction_type: PredictionType,
    seed: u64,
) -> PredictionResult {
    let options = PredictOptions {
        seed: Some(seed),
        ..PredictOptions::default()
    };
    predict_marginal(
        model,
        &TermSpec::parse(terms).unwrap(),
        prediction_type,
        &Condition::new(),
        &options,
    )
    .unwrap()
}

fn levels(result: &PredictionResult, column: usize) -> Vec<String> {
    result
        .iter()
        .map(|row| row.values[column].to_string())
        .collect()
}

#[test]
fn fixed_and_random_share_points_and_random_is_wider() {
    let model = mixed_logit_model();
    for terms in [&["x"][..], &["group", "x [-1,0,1]"][..]] {
        let fixed = predict(&model, terms, PredictionType::Fixed, 1);
        let random = predict(&model, terms, PredictionType::Random, 1);
        assert_eq!(fixed.len(), random.len());
        for (f, r) in fixed.iter().zip(random.iter()) {
            assert_eq!(f.values, r.values);
            assert_eq!(f.predicted, r.predicted);
            assert!(r.interval_width().unwrap() >= f.interval_width().unwrap());
            assert!(r.std_error.unwrap() > f.std_error.unwrap());
        }
    }
}

#[test]
fn every_bound_brackets_its_prediction() {
    let logit = mixed_logit_model();
    let zi = zero_inflated_model();
    let cases = [
        (&logit, PredictionType::Fixed),
        (&logit, PredictionType::Random),
        (&logit, PredictionType::Sim),
        (&zi, PredictionType::ZeroInflated),
        (&zi, PredictionType::ZiRandom),
        (&zi, PredictionType::Sim),
    ];
    for (model, prediction_type) in cases {
        let terms: &[&str] = if model.has_zero_inflation() {
            &["treatment"]
        } else {
            &["x [-2,0,2]", "group"]
        };
        let result = predict(model, terms, prediction_type, 5);
        for row in result.iter() {
            let (low, high) = (row.conf_low.unwrap(), row.conf_high.unwrap());
            assert!(
                low <= row.predicted && row.predicted <= high,
                "{prediction_type}: {low} <= {} <= {high}",
                row.predicted
            );
        }
    }
}

#[test]
fn zi_random_keeps_the_point_and_widens_the_interval() {
    let model = zero_inflated_model();
    let zi = predict(&model, &["treatment"], PredictionType::ZeroInflated, 21);
    let zi_random = predict(&model, &["treatment"], PredictionType::ZiRandom, 21);
    for (a, b) in zi.iter().zip(zi_random.iter()) {
        assert_eq!(a.predicted, b.predicted);
        assert!(b.interval_width().unwrap() >= a.interval_width().unwrap());
    }

    let mu = 1.2_f64.exp();
    let pi = LinkFunction::Logit.inverse(-1.0);
    assert_abs_diff_eq!(zi.rows[0].predicted, mu * (1.0 - pi), epsilon = 1e-12);
}

#[test]
fn explicit_levels_restrict_and_order_rows() {
    let model = mixed_logit_model();
    let result = predict(&model, &["x [0]", "group [C,A]"], PredictionType::Fixed, 0);
    assert_eq!(levels(&result, 1), vec!["C", "A"]);

    let result = predict(&model, &["group [D,B]", "x [-1,1]"], PredictionType::Fixed, 0);
    assert_eq!(levels(&result, 0), vec!["D", "D", "B", "B"]);
    assert_eq!(levels(&result, 1), vec!["-1", "1", "-1", "1"]);
}

#[test]
fn sampling_returns_distinct_levels_capped_at_the_level_count() {
    let model = mixed_logit_model();
    for n in 0..=7 {
        let terms = TermSpec::parse(&[format!("site [sample={n}]")]).unwrap();
        let outcome = predict_marginal(
            &model,
            &terms,
            PredictionType::Fixed,
            &Condition::new(),
            &PredictOptions {
                seed: Some(n as u64),
                ..PredictOptions::default()
            },
        );
        if n == 0 {
            assert!(matches!(outcome, Err(PredictionError::EmptyLevelSet(_))));
            continue;
        }
        let result = outcome.unwrap();
        let mut sampled = levels(&result, 0);
        assert_eq!(sampled.len(), n.min(5));
        sampled.sort();
        sampled.dedup();
        assert_eq!(sampled.len(), n.min(5));
    }
}

#[test]
fn single_factor_model_reproduces_group_means() {
    let labels = ["a", "a", "a", "b", "b", "c", "c", "c", "c", "d", "d", "d"];
    let y = [
        3.1, 2.9, 3.4, 5.0, 5.6, 1.2, 0.8, 1.1, 0.9, 7.7, 8.1, 7.9,
    ];
    let level_names = ["a", "b", "c", "d"];
    let rows: Vec<f64> = labels
        .iter()
        .flat_map(|label| {
            let mut row = vec![1.0, 0.0, 0.0, 0.0];
            if let Some(k) = level_names.iter().position(|l| l == label).filter(|&k| k > 0) {
                row[k] = 1.0;
            }
            row
        })
        .collect();
    let x = Array2::from_shape_vec((labels.len(), 4), rows).unwrap();
    let fit = ols(&x, &Array1::from(y.to_vec()));

    let model = FittedModel {
        family: Family::Gaussian,
        conditional: LinearPredictor {
            link: LinkFunction::Identity,
            terms: vec![ModelTerm::Intercept, ModelTerm::factor("g")],
            coefficients: fit.coefficients,
            covariance: fit.covariance,
        },
        zero_inflation: None,
        random_effects: None,
        residual_df: Some(fit.df),
        dispersion: Some(fit.sigma),
        frame: ModelFrame::new().with("g", Variable::categorical(level_names)),
    };

    let result = predict(&model, &["g"], PredictionType::Fixed, 0);
    assert_eq!(result.len(), 4);
    for (row, level) in result.iter().zip(level_names) {
        let members: Vec<f64> = labels
            .iter()
            .zip(y)
            .filter(|(l, _)| **l == level)
            .map(|(_, v)| v)
            .collect();
        let mean = members.iter().sum::<f64>() / members.len() as f64;
        assert_eq!(row.values, vec![Value::Level(level.to_string())]);
        assert_abs_diff_eq!(row.predicted, mean, epsilon = 1e-3);
    }
}

#[test]
fn batch_predictions_match_the_model_at_mean_temperature() {
    let model = batch_model();
    let temps = model.frame.numeric_values("temp").unwrap();
    let mean_temp = temps.iter().sum::<f64>() / temps.len() as f64;

    let result = predict(&model, &["batch"], PredictionType::Fixed, 0);
    assert_eq!(result.len(), 3);
    for (row, batch) in result.iter().zip(["A", "B", "C"]) {
        let x = Array1::from(batch_design_row(batch, mean_temp).to_vec());
        let expected = x.dot(&model.conditional.coefficients);
        assert_abs_diff_eq!(row.predicted, expected, epsilon = 1e-3);
        let se = x.dot(&model.conditional.covariance.dot(&x)).sqrt();
        assert_abs_diff_eq!(row.std_error.unwrap(), se, epsilon = 1e-9);
    }
}

#[test]
fn conditioning_shifts_predictions_along_the_design() {
    let model = batch_model();
    let terms = TermSpec::parse(&["batch"]).unwrap();
    let options = PredictOptions::default();
    let at_mean = predict_marginal(&model, &terms, PredictionType::Fixed, &Condition::new(), &options)
        .unwrap();
    let at_30 = predict_marginal(
        &model,
        &terms,
        PredictionType::Fixed,
        &Condition::new().with("temp", Value::Number(30.0)),
        &options,
    )
    .unwrap();

    let temps = model.frame.numeric_values("temp").unwrap();
    let mean_temp = temps.iter().sum::<f64>() / temps.len() as f64;
    let slope = model.conditional.coefficients[3];
    for (a, b) in at_mean.iter().zip(at_30.iter()) {
        assert_abs_diff_eq!(b.predicted - a.predicted, slope * (30.0 - mean_temp), epsilon = 1e-9);
    }
}

#[test]
fn simulation_is_reproducible_per_seed() {
    let model = mixed_logit_model();
    let first = predict(&model, &["group"], PredictionType::Sim, 99);
    let again = predict(&model, &["group"], PredictionType::Sim, 99);
    assert_eq!(first, again);

    let model = zero_inflated_model();
    let a = predict(&model, &["treatment"], PredictionType::ZeroInflated, 1);
    let b = predict(&model, &["treatment"], PredictionType::ZeroInflated, 2);
    assert!(
        a.iter()
            .zip(b.iter())
            .any(|(x, y)| x.conf_low != y.conf_low || x.conf_high != y.conf_high)
    );
    assert!(a.iter().all(|row| row.std_error.is_none()));
}

#[test]
fn simulated_bounds_change_with_the_seed() {
    let model = batch_model();
    let a = predict(&model, &["batch"], PredictionType::Sim, 1);
    let b = predict(&model, &["batch"], PredictionType::Sim, 2);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.values, y.values);
        assert_ne!(x.conf_low, y.conf_low);
        assert_ne!(x.conf_high, y.conf_high);
        assert!(x.std_error.is_none());
    }
    assert_eq!(a, predict(&model, &["batch"], PredictionType::Sim, 1));
}

#[test]
fn gamma_simulation_survives_draws_with_negative_means() {
    let model = FittedModel {
        family: Family::Gamma,
        conditional: LinearPredictor {
            link: LinkFunction::Inverse,
            terms: vec![ModelTerm::Intercept, ModelTerm::numeric("x")],
            coefficients: ndarray::array![0.2, 0.01],
            covariance: ndarray::array![[0.01, 0.0], [0.0, 1e-4]],
        },
        zero_inflation: None,
        random_effects: None,
        residual_df: None,
        dispersion: Some(0.5),
        frame: ModelFrame::new().with("x", Variable::numeric(vec![-4.0, -2.0, 0.0, 2.0, 4.0])),
    };
    let result = predict(&model, &["x [-4,0,4]"], PredictionType::Sim, 17);
    assert_eq!(result.len(), 3);
    for row in result.iter() {
        let (low, high) = (row.conf_low.unwrap(), row.conf_high.unwrap());
        assert!(row.predicted.is_finite());
        assert!(0.0 < low && low <= high, "{low} .. {high}");
    }
}

#[test]
fn malformed_terms_are_syntax_errors() {
    assert!(matches!(
        TermSpec::parse(&["x [1,2"]),
        Err(TermError::UnbalancedBrackets(_))
    ));
    assert!(matches!(
        TermSpec::parse(&["x [bogus=3]"]),
        Err(TermError::UnknownSelector { .. })
    ));
    assert!(matches!(TermSpec::parse(&["x []"]), Err(TermError::EmptySelector { .. })));
    assert!(matches!(TermSpec::parse(&["x", "x [1]"]), Err(TermError::Duplicate(_))));
}

#[test]
fn missing_capabilities_fail_with_unsupported_model() {
    let model = batch_model();
    let terms = TermSpec::parse(&["batch"]).unwrap();
    for prediction_type in [
        PredictionType::Random,
        PredictionType::ZeroInflated,
        PredictionType::ZiRandom,
    ] {
        let err = predict_marginal(
            &model,
            &terms,
            prediction_type,
            &Condition::new(),
            &PredictOptions::default(),
        )
        .unwrap_err();
        assert!(
            matches!(err, PredictionError::UnsupportedModel { .. }),
            "{prediction_type}: {err}"
        );
    }
}

#[test]
fn logit_intervals_are_bounded_and_asymmetric() {
    let model = mixed_logit_model();
    let result = predict(&model, &["x [-2,2]"], PredictionType::Random, 0);
    for row in result.iter() {
        let (low, high) = (row.conf_low.unwrap(), row.conf_high.unwrap());
        assert!(0.0 < low && high < 1.0);
        let (below, above) = (row.predicted - low, high - row.predicted);
        assert!((below - above).abs() > 1e-3, "interval is symmetric: {below} vs {above}");
    }
}

#[test]
fn grouping_levels_use_conditional_modes() {
    let model = mixed_logit_model();
    let result = predict(&model, &["site [s3,s4]"], PredictionType::Random, 0);
    let mean_x = [-2.0, -1.2, -0.5, 0.0, 0.4, 1.1, 1.6, 2.3].iter().sum::<f64>() / 8.0;
    let base = -0.5 + 0.8 * mean_x;
    assert_abs_diff_eq!(
        result.rows[0].predicted,
        LinkFunction::Logit.inverse(base + 0.9),
        epsilon = 1e-12
    );
    assert_abs_diff_eq!(
        result.rows[1].predicted,
        LinkFunction::Logit.inverse(base - 1.1),
        epsilon = 1e-12
    );
    assert!(result.iter().all(|row| row.conf_low.is_none() && row.std_error.is_none()));

    let simulated = predict(&model, &["site [s3,s4]"], PredictionType::Sim, 3);
    assert!(simulated.iter().all(|row| row.conf_low.is_some()));
    assert!(simulated.rows[0].predicted > simulated.rows[1].predicted);
}
